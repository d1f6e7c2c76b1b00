use clap::{App, Arg};
use std::net::SocketAddr;

use windbus::broker::{BrokerConfig, StubBroker};

const DEFAULT_PORT: &str = "1883";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("windbus-broker")
        .version("0.1.0")
        .about("Standalone stub broker for the wind turbine demo")
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Port to listen on")
                .takes_value(true)
                .default_value(DEFAULT_PORT),
        )
        .get_matches();

    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let bind_addr: SocketAddr = ([0, 0, 0, 0], port).into();

    let broker = StubBroker::start(BrokerConfig {
        bind_addr,
        hold_connack: false,
    })
    .await?;
    println!("broker listening on {}", broker.addr());

    tokio::signal::ctrl_c().await?;
    broker.shutdown().await;
    println!("broker stopped");

    Ok(())
}

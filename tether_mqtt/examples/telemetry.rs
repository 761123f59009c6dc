// Copyright (c) Tetherline.
// Licensed under the MIT License.

// Publish a telemetry reading every second and echo everything under the
// telemetry root. Run against a local broker:
//   cargo run --example telemetry -- 127.0.0.1 1883

use std::env;
use std::time::Duration;

use tether_mqtt::control_packet::QoS;
use tether_mqtt::{Client, ConnectOptionsBuilder};

#[tokio::main]
async fn main() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .init();

    let mut args = env::args().skip(1);
    let hostname = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port: u16 = args
        .next()
        .map(|p| p.parse().expect("port must be a number"))
        .unwrap_or(1883);

    let client = Client::new();
    let connection = client.connection();
    connection
        .set_interruption_handlers(
            |err| log::warn!("connection interrupted: {err}"),
            |session_present| log::info!("connection resumed (session_present={session_present})"),
        )
        .unwrap();

    let options = ConnectOptionsBuilder::default()
        .hostname(hostname)
        .port(port)
        .clean_session(false)
        .keep_alive(Duration::from_secs(30))
        .operation_timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    connection
        .connect(options, |result| match result {
            Ok(ack) => log::info!("connected (session_present={})", ack.session_present),
            Err(e) => log::error!("connect failed: {e}"),
        })
        .unwrap();

    connection
        .subscribe(
            "telemetry/#",
            QoS::Level1,
            |publication| {
                log::info!(
                    "{} => {}",
                    publication.topic,
                    String::from_utf8_lossy(&publication.payload)
                );
            },
            |_, result| log::info!("subscribed: {result:?}"),
        )
        .unwrap();

    let mut reading: u64 = 0;
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        reading += 1;
        let payload = format!("{{\"reading\":{reading}}}");
        if let Err(e) = connection.publish(
            "telemetry/demo",
            QoS::Level1,
            false,
            payload.as_bytes(),
            |id, result| {
                if let Err(e) = result {
                    log::warn!("publish {id} failed: {e}");
                }
            },
        ) {
            log::error!("publish rejected: {e}");
        }
    }
}

mod sim;

use meshwatch_devkit::MeshEnvelope;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::time::{Duration, sleep};

use crate::sim::{Odds, default_fleet};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let host = env_or("SIM_MQTT_HOST", "localhost");
    let port: u16 = env_or("SIM_MQTT_PORT", "1883").parse()?;
    let topic = env_or("SIM_TOPIC", &MeshEnvelope::topic("EU_868", "!5e0a0001"));
    let every = humantime::parse_duration(&env_or("SIM_INTERVAL", "2s"))?;

    let mut opts = MqttOptions::new("meshwatch-simulator", host.as_str(), port);
    opts.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(opts, 32);
    log::info!("publishing simulated telemetry to {host}:{port} on {topic} every {}", humantime::format_duration(every));

    // the event loop must be polled for publishes to leave
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => log::info!("connected to broker"),
                Ok(_) => {}
                Err(e) => {
                    log::warn!("broker unreachable: {e}");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    let mut fleet = default_fleet();
    let odds = Odds::default();
    loop {
        for (node, machine) in fleet.iter_mut().enumerate() {
            let Some(reading) = machine.step(&mut rand::rng(), odds) else {
                continue;
            };
            if reading.event.is_some() {
                log::info!("{} goes offline", machine.id);
            }
            let text = serde_json::to_string(&reading)?;
            let envelope = MeshEnvelope::text(0x5e0a_1000 + node as u32, &text);
            if let Err(e) = client
                .publish(topic.as_str(), QoS::AtMostOnce, false, serde_json::to_vec(&envelope)?)
                .await
            {
                log::error!("publish failed for {}: {e}", machine.id);
            }
        }
        sleep(every).await;
    }
}

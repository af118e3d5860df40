use std::process;

use anyhow::Result;
use log::info;
use structopt::StructOpt;

use mqtt_client::{ConnectionSettings, LastWill, MqttClient, ProtocolVersion, QoS};

#[derive(StructOpt, Debug)]
#[structopt(
    name = "sub_client",
    about = "an MQTT version 3.1/3.1.1 client for subscribing to topics"
)]
struct Opt {
    /// Specify the host to connect to.
    #[structopt(short, long, default_value = "localhost")]
    host: String,

    /// Connect to the port specified.
    #[structopt(short, long, default_value = "1883")]
    port: u16,

    /// Specify which version of the MQTT protocol should be used when connecting to the remote broker.
    #[structopt(short = "V", long, default_value = "3.1.1")]
    protocol_version: ProtocolVersion,

    /// The id to use for this client.
    #[structopt(short, long)]
    id: Option<String>,

    /// The number of seconds between sending PING commands to the broker
    /// for the purposes of informing it we are still connected and functioning.
    #[structopt(short, long, default_value = "60")]
    keep_alive: u16,

    /// The topic on which to send a Will, in the event that the client disconnects unexpectedly.
    #[structopt(long)]
    will_topic: Option<String>,

    /// Specify a message that will be stored by the broker and sent out if this client disconnects unexpectedly.
    #[structopt(long, default_value = "")]
    will_payload: String,

    /// Provide a username to be used for authenticating with the broker.
    #[structopt(short, long)]
    username: Option<String>,

    /// Provide a password to be used for authenticating with the broker.
    #[structopt(short = "P", long)]
    password: Option<String>,

    /// Connect to the broker requesting a clean session.
    #[structopt(short, long)]
    clean_session: bool,

    /// The MQTT topic filters to subscribe to.
    #[structopt(short, long, required = true)]
    topic: Vec<String>,

    /// The QoS to request for the subscriptions.
    #[structopt(short, long, default_value = "0")]
    qos: u8,
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();

    let qos = match opt.qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        qos => {
            eprintln!("QoS {} is not a thing", qos);
            process::exit(1);
        }
    };

    let mut client = MqttClient::new(opt.host, opt.port).with_protocol_version(opt.protocol_version);
    if let Some(id) = opt.id {
        client = client.with_client_id(id);
    }

    let settings = ConnectionSettings {
        username: opt.username,
        password: opt.password.map(String::into_bytes),
        keep_alive_interval: opt.keep_alive,
        last_will: {
            let will_payload = opt.will_payload.into_bytes();
            opt.will_topic.map(|topic| LastWill {
                topic,
                payload: will_payload,
                qos: QoS::AtMostOnce,
                retain: false,
            })
        },
        ..Default::default()
    };

    client.connect(settings, opt.clean_session)?;

    for topic_filter in &opt.topic {
        info!("subscribing to `{}`", topic_filter);
        client.subscribe(topic_filter, qos, |_, topic, payload, retained| {
            println!(
                "{}{}: {}",
                topic,
                if retained { " (retained)" } else { "" },
                String::from_utf8_lossy(payload)
            );
        })?;
    }

    client.run()?;
    client.disconnect()?;

    Ok(())
}

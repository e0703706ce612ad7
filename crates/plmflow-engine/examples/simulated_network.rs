//! A dimmer and a relay on a simulated modem.
//!
//! Outbound messages go through a `ChannelDriver`; a fake modem task prints
//! them and answers each one with an acknowledgement from the addressed
//! device, which is routed back through the registry.
//!
//! Run with `cargo run -p plmflow-engine --example simulated_network`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::time;

use plmflow_core::clock::{SharedClock, SystemClock};
use plmflow_core::config::ConfigBuilder;
use plmflow_core::event::{EventBus, FeatureEvent};
use plmflow_core::logging;
use plmflow_core::types::{Id, InsteonAddress};
use plmflow_devices::{
    ChannelDriver, Command, DeviceCatalog, DeviceDescriptor, DeviceRegistry, DeviceServices,
    FeatureRegistry, InitStatus, MsgFactory, SharedDeviceRegistry,
};
use plmflow_engine::{Poller, RequestQueueManager};

const MODEM: InsteonAddress = InsteonAddress::new(0xAA, 0xBB, 0xCC);
const ACK_FLAGS: u8 = 0x2B;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ConfigBuilder::new().with_environment_prefix("PLMFLOW").build()?;
    logging::init_from_config(&config.logging)?;

    let clock: SharedClock = Arc::new(SystemClock);
    let manager = Arc::new(RequestQueueManager::new(clock.clone(), &config.scheduler));
    let (driver, mut outbound) = ChannelDriver::new(Some(config.modem.port.clone()));

    let features = FeatureRegistry::with_defaults();
    let catalog = DeviceCatalog::with_defaults(&features)?;
    let messages = Arc::new(MsgFactory::with_defaults()?);
    let services = DeviceServices {
        driver: Arc::new(driver),
        scheduler: manager.clone(),
        catalog: Arc::new(catalog),
        features: Arc::new(features),
        messages: Arc::clone(&messages),
        clock,
    };

    let registry: SharedDeviceRegistry = Arc::new(
        DeviceRegistry::new(services)
            .with_default_port(config.modem.port.clone())
            .with_default_poll_interval(config.modem.default_poll_interval_ms),
    );
    let bus = Arc::new(EventBus::new());
    let mut states = bus.subscribe();

    let lamp = registry.get_or_create("1A.2B.3C".parse()?);
    lamp.add_descriptor(DeviceDescriptor::new(0x01, 0x20, 0x45));
    lamp.set_product_key("F00.00.20");
    lamp.instantiate_features();
    lamp.set_init_status(InitStatus::Initialized);

    let fan = registry.get_or_create("2D.3E.4F".parse()?);
    fan.add_descriptor(DeviceDescriptor::new(0x02, 0x2A, 0x43));
    fan.set_product_key("F00.00.11");
    fan.instantiate_features();
    fan.set_init_status(InitStatus::Initialized);

    for (device, feature) in [(&lamp, "dimmer"), (&fan, "switch")] {
        device
            .feature(feature)
            .with_context(|| format!("{} has no {} feature", device.address(), feature))?
            .add_listener(Id::from(format!("{}-{}", device.address(), feature)));
    }
    println!("devices:\n  {}\n  {}", lamp, fan);

    // The fake modem acknowledges every message with its own command bytes.
    let modem = {
        let registry = Arc::clone(&registry);
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            while let Some(out) = outbound.recv().await {
                println!("-> {} {}", out.port, out.msg);
                let ack = messages.make_message("StandardMessageReceived").and_then(|mut ack| {
                    ack.set_address("fromAddress", out.msg.get_address("toAddress")?)?;
                    ack.set_address("toAddress", MODEM)?;
                    ack.set_byte("messageFlags", ACK_FLAGS)?;
                    ack.set_byte("command1", out.msg.get_byte("command1")?)?;
                    ack.set_byte("command2", out.msg.get_byte("command2")?)?;
                    Ok(ack)
                });
                match ack {
                    Ok(ack) => {
                        println!("<- {} {}", out.port, ack);
                        if let Err(e) = registry.route_message(&out.port, &ack, bus.as_ref()) {
                            eprintln!("cannot route {}: {}", ack, e);
                        }
                    }
                    Err(e) => eprintln!("cannot acknowledge {}: {}", out.msg, e),
                }
            }
        })
    };

    manager.start().await?;
    let poller = Poller::from_config(Arc::clone(&registry), &config);
    poller.start().await?;

    lamp.process_command(&Command::Percent(60));
    fan.process_command(&Command::On);
    lamp.process_command(&Command::Refresh);

    let mut seen = 0;
    while seen < 3 {
        match time::timeout(Duration::from_secs(5), states.recv()).await {
            Ok(Ok(FeatureEvent::StateChanged {
                address,
                feature,
                value,
                ..
            })) => {
                println!("state: {} {} = {:?}", address, feature, value);
                seen += 1;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => anyhow::bail!("event bus closed: {}", e),
            Err(_) => anyhow::bail!("timed out waiting for device state"),
        }
    }

    poller.stop().await?;
    manager.stop().await?;
    modem.abort();
    Ok(())
}

//! swarmnode ESP-IDF std firmware
//!
//! Boots a swarm node on FreeRTOS threads: the node's storage and model
//! workers run over the FAT data partition, beacons go out over ESP-NOW,
//! and status lines are logged through the ESP-IDF logger.

mod espnow;
mod storage;

use std::thread;
use std::time::Duration;

use esp_idf_svc::hal::peripherals::Peripherals;
use esp_idf_svc::sys::esp_get_free_heap_size;
use esp_idf_svc::wifi::{BlockingWifi, EspWifi};
use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs::EspDefaultNvsPartition};

use swarmnode::beacon::StaticInput;
use swarmnode::board;
use swarmnode::dense::DenseBuilder;
use swarmnode::protocol::VERSION;
use swarmnode::storage::StdFs;
use swarmnode::{Node, NodeConfig, NodeId, NodeParts};

use espnow::EspNowTransport;

/// Optional JSON overrides on the data partition.
const CONFIG_FILE: &str = "node.json";

/// Warn when free heap drops below this many bytes.
const LOW_HEAP_BYTES: u32 = 16 * 1024;

fn main() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    // Bind the ESP-IDF logger to the `log` facade
    esp_idf_svc::log::EspLogger::initialize_default();

    log::info!("swarmnode v{} starting on {} (std)", VERSION, board::BOARD_NAME);

    // ── Peripherals ──────────────────────────────────────────────────

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    // Hold power on (M5StickC Plus2)
    #[cfg(feature = "m5stickc")]
    let _power_hold = {
        use esp_idf_svc::hal::gpio::PinDriver;
        let mut p = PinDriver::output(peripherals.pins.gpio4)?;
        p.set_high()?;
        p
    };

    // ── Storage ──────────────────────────────────────────────────────

    storage::mount_data_partition()?;
    let config = load_config();

    // ── WiFi (ESP-NOW needs the STA interface up, not associated) ────

    let mut wifi = BlockingWifi::wrap(
        EspWifi::new(peripherals.modem, sys_loop.clone(), Some(nvs))?,
        sys_loop,
    )?;
    wifi.set_configuration(&esp_idf_svc::wifi::Configuration::Client(Default::default()))?;
    wifi.start()?;
    let identity = NodeId(wifi.wifi().sta_netif().get_mac()?);
    log::info!("station MAC {}", identity);

    let transport = EspNowTransport::take()?;
    log::info!("ESP-NOW initialized");

    // ── Node ─────────────────────────────────────────────────────────

    let input = StaticInput(identity_input(identity, config.model_input_len));
    let node = Node::start(
        config,
        NodeParts {
            identity,
            filesystem: StdFs::new(storage::MOUNT_POINT),
            engine: DenseBuilder,
            transport: Box::new(transport),
            input: Box::new(input),
        },
    )?;

    // ── Heap watch ───────────────────────────────────────────────────

    loop {
        thread::sleep(Duration::from_secs(30));

        let heap_free = unsafe { esp_get_free_heap_size() };
        let stats = node.stats();
        if heap_free < LOW_HEAP_BYTES {
            log::warn!("low heap: {} bytes free", heap_free);
        }
        log::debug!(
            "heap {} tx {} rx {} peers {}",
            heap_free,
            stats.beacons_sent,
            stats.beacons_received,
            node.peers().len()
        );
    }
}

/// Compiled-in defaults, overridden by `node.json` when it parses.
fn load_config() -> NodeConfig {
    let path = format!("{}/{}", storage::MOUNT_POINT, CONFIG_FILE);
    match std::fs::read(&path) {
        Ok(json) => match NodeConfig::from_json(&json) {
            Ok(config) => {
                log::info!("loaded {}", path);
                config
            }
            Err(e) => {
                log::warn!("{} ignored: {}", path, e);
                NodeConfig::default()
            }
        },
        Err(_) => NodeConfig::default(),
    }
}

/// Beacon model input derived from the station MAC, so nodes running the
/// same model still advertise distinct capability vectors.
fn identity_input(identity: NodeId, len: usize) -> Vec<u8> {
    let id = identity.as_bytes();
    (0..len / 4)
        .flat_map(|k| {
            let v = f32::from(id[k % id.len()]) / 255.0 - 0.5;
            v.to_le_bytes()
        })
        .collect()
}

//! ESP-NOW broadcast transport.
//!
//! The receive callback runs in the WiFi driver task and must not block:
//! it only hands the frame to the node's [`FrameSink`].

use esp_idf_svc::espnow::{EspNow, PeerInfo, BROADCAST};
use esp_idf_svc::sys::wifi_interface_t_WIFI_IF_STA;

use swarmnode::error::NodeError;
use swarmnode::transport::{FrameSink, PeerTransport};
use swarmnode::NodeId;

pub struct EspNowTransport {
    espnow: EspNow<'static>,
}

impl EspNowTransport {
    /// Take the ESP-NOW driver. WiFi must already be started in STA mode.
    pub fn take() -> anyhow::Result<Self> {
        let espnow = EspNow::take()?;
        espnow.add_peer(PeerInfo {
            peer_addr: BROADCAST,
            channel: 0,
            ifidx: wifi_interface_t_WIFI_IF_STA,
            encrypt: false,
            ..Default::default()
        })?;
        Ok(Self { espnow })
    }
}

impl PeerTransport for EspNowTransport {
    fn start(&mut self, sink: FrameSink) -> Result<(), NodeError> {
        self.espnow
            .register_recv_cb(move |info, data| {
                let rssi = info.rx_ctrl.rssi() as i8;
                if !sink.offer(NodeId(*info.src_addr), rssi, data) {
                    log::trace!("espnow frame dropped");
                }
            })
            .map_err(|e| NodeError::Transport(format!("recv callback: {e}")))
    }

    fn broadcast(&mut self, frame: &[u8]) -> Result<(), NodeError> {
        self.espnow
            .send(BROADCAST, frame)
            .map_err(|e| NodeError::Transport(format!("send: {e}")))
    }

    fn stop(&mut self) {
        if let Err(e) = self.espnow.unregister_recv_cb() {
            log::warn!("espnow unregister failed: {}", e);
        }
    }
}

//! Asynchronous command API for the Marstek B2500.
//!
//! [`B2500`] wraps a [`Transport`] and turns every device command into a single
//! `async` call: it encodes the frame, registers the wait for the response
//! before writing, and returns the record the dispatcher decoded from the
//! notification. The client is cheap to clone and all methods take `&self`.

use crate::correlator::Correlator;
use crate::dispatcher::{DeviceState, Dispatcher};
use crate::protocol::{self as proto, Opcode};
use crate::response::{self, CellPack, DeviceInfo, RuntimeSnapshot, TimerSchedule};
use crate::tokio_common::Result;
use crate::transport::Transport;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Deadlines and delays used by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Timeouts {
    /// Deadline for ordinary requests and acknowledgements.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub response: Duration,
    /// Deadline for each cell voltage request.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub cells: Duration,
    /// Pause before the cell voltage request is retried.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub cell_retry_delay: Duration,
    /// Pause after the connection handshake.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub settle: Duration,
    /// Deadline for the handshake request sent right after subscribing.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub handshake: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            response: Duration::from_secs(3),
            cells: Duration::from_secs(5),
            cell_retry_delay: Duration::from_secs(1),
            settle: Duration::from_secs(1),
            handshake: Duration::from_millis(200),
        }
    }
}

/// Asynchronous client for one B2500 battery.
pub struct B2500<T> {
    transport: Arc<T>,
    dispatcher: Dispatcher,
    correlator: Arc<Correlator>,
    timeouts: Timeouts,
}

impl<T> Clone for B2500<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            dispatcher: self.dispatcher.clone(),
            correlator: Arc::clone(&self.correlator),
            timeouts: self.timeouts,
        }
    }
}

impl<T: Transport> B2500<T> {
    /// Creates a client with default timeouts.
    ///
    /// The dispatcher is not subscribed yet; use [`B2500::connect`] for a ready
    /// to use client.
    pub fn new(transport: T) -> Self {
        Self::with_timeouts(transport, Timeouts::default())
    }

    pub fn with_timeouts(transport: T, timeouts: Timeouts) -> Self {
        let correlator = Arc::new(Correlator::new());
        let state = Arc::new(Mutex::new(DeviceState::default()));
        Self {
            transport: Arc::new(transport),
            dispatcher: Dispatcher::new(state, Arc::clone(&correlator)),
            correlator,
            timeouts,
        }
    }

    /// Subscribes to notifications and performs the connection handshake.
    ///
    /// The handshake is a device info request with a short deadline. Devices
    /// often do not answer it, so a timeout is ignored.
    pub async fn connect(transport: T, timeouts: Timeouts) -> Result<Self> {
        let client = Self::with_timeouts(transport, timeouts);
        client.transport.subscribe(client.dispatcher.clone()).await?;

        match client
            .request(Opcode::DeviceInfo, proto::DEFAULT_PAYLOAD, timeouts.handshake)
            .await
        {
            Ok(_) => log::debug!("Handshake answered"),
            Err(error) if error.is_timeout() => log::debug!("Handshake not answered"),
            Err(error) => return Err(error),
        }
        tokio::time::sleep(timeouts.settle).await;

        log::info!("Connected");
        Ok(client)
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Returns a copy of the latest decoded records.
    pub fn state(&self) -> DeviceState {
        self.dispatcher.snapshot()
    }

    /// Returns `true` while a request for `opcode` waits for its response.
    pub fn is_awaiting(&self, opcode: u8) -> bool {
        self.correlator.is_awaiting(opcode)
    }

    /// Returns the dispatcher feeding this client.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.transport.disconnect().await?;
        log::info!("Disconnected");
        Ok(())
    }

    async fn send(&self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        let frame = proto::encode(opcode.code(), payload);
        log::debug!("Sending {opcode}: {}", hex::encode(&frame));
        self.transport.write(&frame).await?;
        Ok(())
    }

    /// Sends a command and waits for the notification carrying its opcode.
    async fn request(&self, opcode: Opcode, payload: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let pending = self
            .correlator
            .register(opcode.code(), Instant::now() + timeout)?;
        self.send(opcode, payload).await?;
        pending.await_result().await
    }

    /// Sends a setting and waits for the acknowledgement.
    ///
    /// A missing acknowledgement is only logged, the write itself succeeded.
    async fn configure(&self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        match self.request(opcode, payload, self.timeouts.response).await {
            Ok(_) => log::info!("{opcode} acknowledged"),
            Err(error) if error.is_timeout() => {
                log::warn!("{opcode} was sent but not acknowledged")
            }
            Err(error) => return Err(error),
        }
        Ok(())
    }

    /// Reads the device identification.
    pub async fn get_device_info(&self) -> Result<Option<DeviceInfo>> {
        self.request(Opcode::DeviceInfo, proto::DEFAULT_PAYLOAD, self.timeouts.response)
            .await?;
        Ok(self.dispatcher.with_state(|state| state.device_info.clone()))
    }

    /// Reads the runtime snapshot: PV inputs, battery, outputs and settings.
    ///
    /// Returns the latest successfully decoded snapshot, which is older than
    /// this request if the response could not be decoded.
    pub async fn get_runtime_info(&self) -> Result<Option<RuntimeSnapshot>> {
        self.request(Opcode::RuntimeInfo, proto::DEFAULT_PAYLOAD, self.timeouts.response)
            .await?;
        Ok(self.dispatcher.with_state(|state| state.runtime.clone()))
    }

    /// Reads the output timer schedule.
    pub async fn get_timer_settings(&self) -> Result<Option<TimerSchedule>> {
        self.request(Opcode::GetTimers, proto::DEFAULT_PAYLOAD, self.timeouts.response)
            .await?;
        Ok(self.dispatcher.with_state(|state| state.timers.clone()))
    }

    /// Reads the per-cell voltages.
    ///
    /// Firmware versions differ in the request parameter they answer to: `0x00`
    /// is tried first and, if unanswered, `0x01` after a short pause.
    pub async fn get_cell_voltages(&self) -> Result<Option<CellPack>> {
        match self
            .request(Opcode::CellVoltages, &[0x00], self.timeouts.cells)
            .await
        {
            Ok(_) => {}
            Err(error) if error.is_timeout() => {
                log::info!("No cell voltage response, retrying with alternate request");
                tokio::time::sleep(self.timeouts.cell_retry_delay).await;
                self.request(Opcode::CellVoltages, &[0x01], self.timeouts.cells)
                    .await?;
            }
            Err(error) => return Err(error),
        }
        Ok(self.dispatcher.with_state(|state| state.cells.clone()))
    }

    /// Reads the SSID of the configured Wi-Fi network.
    pub async fn get_wifi_ssid(&self) -> Result<String> {
        let frame = self
            .request(Opcode::GetSsid, proto::DEFAULT_PAYLOAD, self.timeouts.response)
            .await?;
        Ok(response::text_body(&frame))
    }

    /// Reads the firmware version of the FC41D Wi-Fi module.
    pub async fn get_wifi_module_version(&self) -> Result<String> {
        let frame = self
            .request(
                Opcode::GetFc41dVersion,
                proto::DEFAULT_PAYLOAD,
                self.timeouts.response,
            )
            .await?;
        Ok(response::text_body(&frame))
    }

    /// Sets the depth of discharge in percent, accepted range 10 to 100.
    ///
    /// Out of range values are rejected before anything is sent.
    pub async fn set_depth_of_discharge(&self, percent: u8) -> Result<()> {
        let dod = proto::DepthOfDischarge::try_from(percent)?;
        log::info!("Setting depth of discharge to {dod}");
        self.configure(Opcode::SetDepthOfDischarge, &dod.encode())
            .await
    }

    /// Sets the grid region: 0 = EU, 1 = China, 2 = Non-EU.
    pub async fn set_region(&self, region: u8) -> Result<()> {
        let region = proto::Region::try_from(region)?;
        log::info!("Setting region to {region}");
        self.configure(Opcode::SetRegion, &region.encode()).await
    }

    pub async fn enable_adaptive_mode(&self, enable: bool) -> Result<()> {
        let mode = proto::AdaptiveMode::from(enable);
        log::info!("Setting adaptive mode to {mode:?}");
        self.configure(Opcode::EnableAdaptive, &mode.encode()).await
    }

    /// Configures the Wi-Fi network the device connects to.
    pub async fn set_wifi_config(&self, ssid: &str, password: &str) -> Result<()> {
        let config = proto::WifiConfig::new(ssid, password);
        log::info!("Setting Wi-Fi network to {ssid}");
        self.configure(Opcode::SetWifi, &config.encode()).await
    }

    /// Reboots the device. No response is awaited.
    pub async fn reboot(&self) -> Result<()> {
        log::warn!("Rebooting device");
        self.send(Opcode::Reboot, proto::DEFAULT_PAYLOAD).await
    }

    /// Resets the device to its factory settings. No response is awaited.
    pub async fn factory_reset(&self) -> Result<()> {
        log::warn!("Resetting device to factory settings");
        self.send(Opcode::FactoryReset, proto::DEFAULT_PAYLOAD)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode;
    use crate::tokio_common::Error;
    use crate::transport::{self, mock::MockTransport};
    use assert_matches::assert_matches;

    async fn connected(mock: &MockTransport) -> B2500<MockTransport> {
        B2500::connect(mock.clone(), Timeouts::default())
            .await
            .unwrap()
    }

    fn request(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
        encode(opcode.code(), payload)
    }

    fn ack(opcode: Opcode) -> Vec<u8> {
        encode(opcode.code(), &[0x00])
    }

    fn cell_text_frame() -> Vec<u8> {
        encode(
            Opcode::CellVoltages.code(),
            b"85_25_27_3300_3301_3299_3302_3298_3300_3301_3299_3302_3298_3300_3301_3299_3300",
        )
    }

    #[tokio::test(start_paused = true)]
    async fn connect_performs_handshake() {
        let mock = MockTransport::new();
        mock.respond(
            request(Opcode::DeviceInfo, &[0x01]),
            encode(0x04, b"type=HMA-1,id=0123,mac=001122334455,version=210"),
        );
        let client = connected(&mock).await;

        assert_eq!(mock.written(), [request(Opcode::DeviceInfo, &[0x01])]);
        assert_eq!(client.state().device_info.unwrap().firmware, "210");
    }

    #[tokio::test(start_paused = true)]
    async fn connect_ignores_unanswered_handshake() {
        let mock = MockTransport::new();
        let start = Instant::now();
        let client = connected(&mock).await;

        assert!(start.elapsed() >= Duration::from_millis(1200));
        assert!(client.state().device_info.is_none());
        assert!(!client.correlator.is_awaiting(0x04));
    }

    #[tokio::test(start_paused = true)]
    async fn depth_of_discharge_validated_before_sending() {
        let mock = MockTransport::new();
        let client = connected(&mock).await;
        let written = mock.written().len();

        for percent in [5, 150] {
            assert_matches!(
                client.set_depth_of_discharge(percent).await,
                Err(Error::ProtocolError(proto::Error::InvalidParameter { value, .. })) if value == percent
            );
        }
        assert_eq!(mock.written().len(), written);
    }

    #[tokio::test(start_paused = true)]
    async fn depth_of_discharge_sent() {
        let mock = MockTransport::new();
        mock.respond(
            request(Opcode::SetDepthOfDischarge, &[50]),
            ack(Opcode::SetDepthOfDischarge),
        );
        let client = connected(&mock).await;

        client.set_depth_of_discharge(50).await.unwrap();
        let frame = mock.written().pop().unwrap();
        assert_eq!(frame[3], 0x0B);
        assert_eq!(proto::payload(&frame[..frame.len() - 1]), [50]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_acknowledgement_is_not_an_error() {
        let mock = MockTransport::new();
        let client = connected(&mock).await;

        let start = Instant::now();
        client.set_depth_of_discharge(80).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(
            mock.written().last(),
            Some(&request(Opcode::SetDepthOfDischarge, &[80]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn region_validated() {
        let mock = MockTransport::new();
        let client = connected(&mock).await;
        let written = mock.written().len();

        assert_matches!(
            client.set_region(3).await,
            Err(Error::ProtocolError(proto::Error::InvalidParameter { value: 3, .. }))
        );
        assert_eq!(mock.written().len(), written);

        mock.respond(request(Opcode::SetRegion, &[2]), ack(Opcode::SetRegion));
        client.set_region(2).await.unwrap();
        assert_eq!(
            mock.written().last(),
            Some(&request(Opcode::SetRegion, &[2]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn adaptive_mode_inverted() {
        let mock = MockTransport::new();
        mock.respond(request(Opcode::EnableAdaptive, &[0x00]), ack(Opcode::EnableAdaptive));
        mock.respond(request(Opcode::EnableAdaptive, &[0x01]), ack(Opcode::EnableAdaptive));
        let client = connected(&mock).await;

        client.enable_adaptive_mode(true).await.unwrap();
        client.enable_adaptive_mode(false).await.unwrap();
        let written = mock.written();
        assert_eq!(written[written.len() - 2], request(Opcode::EnableAdaptive, &[0x00]));
        assert_eq!(written[written.len() - 1], request(Opcode::EnableAdaptive, &[0x01]));
    }

    #[tokio::test(start_paused = true)]
    async fn wifi_config_payload() {
        let mock = MockTransport::new();
        let client = connected(&mock).await;

        client.set_wifi_config("home", "secret").await.unwrap();
        assert_eq!(
            mock.written().last(),
            Some(&request(Opcode::SetWifi, b"home<.,.>secret"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn runtime_info_returned_after_response() {
        let mock = MockTransport::new();
        let mut body = vec![0u8; 32];
        // Battery level in tenths of a percent at frame offset 10.
        body[6] = 0x58;
        body[7] = 0x02;
        mock.respond(request(Opcode::RuntimeInfo, &[0x01]), encode(0x03, &body));
        let client = connected(&mock).await;

        let runtime = client.get_runtime_info().await.unwrap().unwrap();
        assert_eq!(runtime.battery.percent, 60.0);
        assert_eq!(client.state().runtime, Some(runtime));
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_response_returns_previous_state() {
        let mock = MockTransport::new();
        mock.respond(request(Opcode::GetTimers, &[0x01]), encode(0x13, &[0x00; 4]));
        let client = connected(&mock).await;

        assert_eq!(client.get_timer_settings().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn getter_times_out() {
        let mock = MockTransport::new();
        let client = connected(&mock).await;

        assert_matches!(
            client.get_runtime_info().await,
            Err(Error::ResponseTimeout { opcode: 0x03, .. })
        );
        assert!(!client.correlator.is_awaiting(0x03));
    }

    #[tokio::test(start_paused = true)]
    async fn cell_voltages_first_request() {
        let mock = MockTransport::new();
        mock.respond(request(Opcode::CellVoltages, &[0x00]), cell_text_frame());
        let client = connected(&mock).await;

        let cells = client.get_cell_voltages().await.unwrap().unwrap();
        assert_eq!(cells.soc, 85);
        assert_eq!(cells.cells.len(), 14);
        assert_eq!(
            mock.written().last(),
            Some(&request(Opcode::CellVoltages, &[0x00]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cell_voltages_retry_with_alternate_request() {
        let mock = MockTransport::new();
        mock.respond(request(Opcode::CellVoltages, &[0x01]), cell_text_frame());
        let client = connected(&mock).await;

        let start = Instant::now();
        let cells = client.get_cell_voltages().await.unwrap().unwrap();
        assert!(start.elapsed() >= Duration::from_secs(6));
        assert_eq!(cells.temperature1, 25);

        let written = mock.written();
        assert_eq!(
            written[written.len() - 2..],
            [
                request(Opcode::CellVoltages, &[0x00]),
                request(Opcode::CellVoltages, &[0x01])
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cell_voltages_time_out_after_retry() {
        let mock = MockTransport::new();
        let client = connected(&mock).await;

        assert_matches!(
            client.get_cell_voltages().await,
            Err(Error::ResponseTimeout { opcode: 0x0F, .. })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn text_queries() {
        let mock = MockTransport::new();
        mock.respond(request(Opcode::GetSsid, &[0x01]), encode(0x09, b"home-net\0"));
        mock.respond(
            request(Opcode::GetFc41dVersion, &[0x01]),
            encode(0x23, b" 202310231502 "),
        );
        let client = connected(&mock).await;

        assert_eq!(client.get_wifi_ssid().await.unwrap(), "home-net");
        assert_eq!(client.get_wifi_module_version().await.unwrap(), "202310231502");
    }

    #[tokio::test(start_paused = true)]
    async fn reboot_and_reset_do_not_wait() {
        let mock = MockTransport::new();
        let client = connected(&mock).await;

        let start = Instant::now();
        client.reboot().await.unwrap();
        client.factory_reset().await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(!client.correlator.is_awaiting(0x25));
        assert!(!client.correlator.is_awaiting(0x26));

        let written = mock.written();
        assert_eq!(
            written[written.len() - 2..],
            [request(Opcode::Reboot, &[0x01]), request(Opcode::FactoryReset, &[0x01])]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_propagated() {
        let mock = MockTransport::new();
        let client = connected(&mock).await;
        mock.fail_writes();

        assert_matches!(
            client.get_device_info().await,
            Err(Error::TransportError(transport::Error::Write(_)))
        );
        assert!(!client.correlator.is_awaiting(0x04));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_transport() {
        let mock = MockTransport::new();
        let client = connected(&mock).await;
        client.disconnect().await.unwrap();
        assert!(mock.is_disconnected());
    }
}

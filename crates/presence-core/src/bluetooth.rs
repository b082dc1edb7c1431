//! Live beacon scanning through BlueZ.
//!
//! BlueZ does not expose raw advertisement bytes, only parsed properties. With
//! duplicate reporting enabled every fresh advertisement updates a device's
//! RSSI and manufacturer data, which `bluer` surfaces as another
//! `DeviceAdded` event. Each such event is turned back into the on-air iBeacon
//! layout so it goes through the same decoder as any other source.

use std::fmt;
use std::pin::Pin;

use bluer::{Adapter, AdapterEvent, DiscoveryFilter, DiscoveryTransport, Session};
use futures::{Stream, StreamExt};
use tracing::{debug, info, trace};

use crate::detection::{ibeacon_advertisement, RawFrame};
use crate::source::{FrameSource, SourceError, SourceResult};

type AdapterEvents = Pin<Box<dyn Stream<Item = AdapterEvent> + Send>>;

/// Frame source backed by a BlueZ adapter.
pub struct BluezSource {
    _session: Session,
    adapter: Adapter,
    events: AdapterEvents,
}

impl fmt::Debug for BluezSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BluezSource")
            .field("adapter", &self.adapter.name())
            .finish_non_exhaustive()
    }
}

impl BluezSource {
    /// Power up `adapter_name` (or the default adapter) and start LE discovery.
    ///
    /// # Errors
    ///
    /// Returns an error if no adapter is present or discovery cannot start.
    pub async fn open(adapter_name: Option<&str>) -> SourceResult<Self> {
        let session = Session::new()
            .await
            .map_err(|err| SourceError::SessionInitFailed {
                message: err.to_string(),
            })?;

        let adapter = match adapter_name {
            Some(name) => session.adapter(name),
            None => session.default_adapter().await,
        }
        .map_err(|_| SourceError::AdapterNotFound)?;

        adapter.set_powered(true).await.map_err(discovery_failed)?;
        adapter
            .set_discovery_filter(DiscoveryFilter {
                transport: DiscoveryTransport::Le,
                duplicate_data: true,
                ..Default::default()
            })
            .await
            .map_err(discovery_failed)?;

        let events = adapter
            .discover_devices_with_changes()
            .await
            .map_err(discovery_failed)?;

        info!(adapter = adapter.name(), "BLE discovery started");
        Ok(Self {
            _session: session,
            adapter,
            events: Box::pin(events),
        })
    }
}

/// Rebuild the advertisement `address` last sent, if it was an iBeacon.
///
/// Borrows only the adapter: `BluezSource` is not `Sync`, and the
/// `next_frame` future must be `Send`.
async fn frame_for(adapter: &Adapter, address: bluer::Address) -> Option<RawFrame> {
    let device = adapter.device(address).ok()?;
    let rssi = device.rssi().await.ok().flatten()?;
    let manufacturer_data = device.manufacturer_data().await.ok().flatten()?;
    let payload = ibeacon_advertisement(&manufacturer_data)?;

    // bluer renders addresses most significant byte first; radios deliver
    // them least significant first.
    let mut sender = address.0.to_vec();
    sender.reverse();

    Some(RawFrame::new(payload, sender, rssi))
}

fn discovery_failed(err: bluer::Error) -> SourceError {
    SourceError::DiscoveryFailed {
        message: err.to_string(),
    }
}

impl FrameSource for BluezSource {
    async fn next_frame(&mut self) -> SourceResult<Option<RawFrame>> {
        loop {
            let Some(event) = self.events.next().await else {
                debug!("BlueZ event stream ended");
                return Ok(None);
            };

            if let AdapterEvent::DeviceAdded(address) = event {
                match frame_for(&self.adapter, address).await {
                    Some(frame) => return Ok(Some(frame)),
                    None => trace!(%address, "Ignoring non-beacon advertisement"),
                }
            }
        }
    }
}

//! Mass-storage interface discovery
//!
//! Scans the active configuration of a device for a class 0x08 interface
//! and turns its descriptors into what a session needs: the protocol, the
//! command set and the endpoint addresses.

use super::backend::RusbBackend;
use crate::backend::Endpoints;
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::protocols::Protocol;
use crate::registry::DeviceKey;
use crate::session::{DeviceBinding, DeviceSession};
use protocol::{CommandSet, MASS_STORAGE_CLASS, ProtocolKind};
use rusb::{Context, Device, Direction as UsbDirection, TransferType, UsbContext};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A mass-storage interface and its endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageInterface {
    pub number: u8,
    pub alt_setting: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub bulk_in: Option<u8>,
    pub bulk_out: Option<u8>,
    pub interrupt_in: Option<u8>,
    /// Interfaces in the active configuration
    pub interfaces: usize,
}

impl StorageInterface {
    /// First mass-storage interface of the active configuration
    pub fn find(device: &Device<Context>) -> Result<Option<Self>, rusb::Error> {
        let config = device.active_config_descriptor()?;
        let interfaces = config.num_interfaces() as usize;

        for interface in config.interfaces() {
            for descriptor in interface.descriptors() {
                if descriptor.class_code() != MASS_STORAGE_CLASS {
                    continue;
                }

                let mut found = Self {
                    number: descriptor.interface_number(),
                    alt_setting: descriptor.setting_number(),
                    subclass: descriptor.sub_class_code(),
                    protocol: descriptor.protocol_code(),
                    bulk_in: None,
                    bulk_out: None,
                    interrupt_in: None,
                    interfaces,
                };
                for endpoint in descriptor.endpoint_descriptors() {
                    match (endpoint.transfer_type(), endpoint.direction()) {
                        (TransferType::Bulk, UsbDirection::In) => {
                            found.bulk_in.get_or_insert(endpoint.address());
                        }
                        (TransferType::Bulk, UsbDirection::Out) => {
                            found.bulk_out.get_or_insert(endpoint.address());
                        }
                        (TransferType::Interrupt, UsbDirection::In) => {
                            found.interrupt_in.get_or_insert(endpoint.address());
                        }
                        _ => {}
                    }
                }
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    pub fn protocol_kind(&self) -> Option<ProtocolKind> {
        ProtocolKind::from_interface_protocol(self.protocol)
    }

    pub fn command_set(&self) -> Option<CommandSet> {
        CommandSet::from_subclass(self.subclass)
    }

    /// Endpoints the given protocol needs
    pub fn endpoints(&self, kind: Option<ProtocolKind>) -> Result<Endpoints, SessionError> {
        let bulk_in = self.bulk_in.ok_or(SessionError::MissingEndpoint("bulk-in"))?;
        let bulk_out = self
            .bulk_out
            .ok_or(SessionError::MissingEndpoint("bulk-out"))?;
        if kind == Some(ProtocolKind::ControlBulkInterrupt) && self.interrupt_in.is_none() {
            return Err(SessionError::MissingEndpoint("interrupt-in"));
        }
        Ok(Endpoints {
            interface: self.number,
            bulk_in,
            bulk_out,
            interrupt_in: self.interrupt_in,
        })
    }
}

/// A device with a mass-storage interface
#[derive(Debug, Clone)]
pub struct StorageDeviceInfo {
    pub key: DeviceKey,
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface: StorageInterface,
}

/// Every mass-storage interface currently attached
pub fn list_storage_devices(context: &Context) -> Result<Vec<StorageDeviceInfo>, rusb::Error> {
    let mut found = Vec::new();
    for device in context.devices()?.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(descriptor) => descriptor,
            Err(e) => {
                debug!("Skipping device without descriptor: {}", e);
                continue;
            }
        };
        let interface = match StorageInterface::find(&device) {
            Ok(Some(interface)) => interface,
            Ok(None) => continue,
            Err(e) => {
                debug!(
                    bus = device.bus_number(),
                    address = device.address(),
                    "Cannot read configuration: {}",
                    e
                );
                continue;
            }
        };
        found.push(StorageDeviceInfo {
            key: DeviceKey::new(device.bus_number(), device.address()),
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            interface,
        });
    }
    Ok(found)
}

/// Open a device and bind a session to its mass-storage interface
///
/// The interface's advertised protocol and command set can be overridden
/// through `config`.
pub fn open_session(
    device: &Device<Context>,
    config: &SessionConfig,
) -> Result<DeviceSession, SessionError> {
    let key = DeviceKey::new(device.bus_number(), device.address());
    let interface = StorageInterface::find(device)?.ok_or(SessionError::NoStorageInterface)?;

    let kind = match config.protocol.or_else(|| interface.protocol_kind()) {
        Some(kind) => kind,
        None => return Err(SessionError::UnsupportedProtocol(interface.protocol)),
    };
    let command_set = config.command_set.or_else(|| interface.command_set());
    let command_set = command_set.unwrap_or_else(|| {
        warn!(
            session = %key,
            subclass = interface.subclass,
            "Unknown subclass, assuming SCSI transparent"
        );
        CommandSet::Transparent
    });
    let endpoints = interface.endpoints(Some(kind))?;

    let handle = device.open()?;
    let backend = RusbBackend::claim(
        handle,
        interface.number,
        interface.alt_setting,
        interface.interfaces,
        config,
    )?;
    info!(
        session = %key,
        interface = interface.number,
        protocol = %kind,
        "Opened mass-storage interface"
    );

    DeviceSession::bind(
        DeviceBinding {
            key,
            endpoints,
            protocol: Protocol::from_kind(kind),
            command_set,
        },
        Arc::new(backend),
        config,
    )
}

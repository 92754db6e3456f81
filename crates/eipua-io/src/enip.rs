//! Device transport over EtherNet/IP explicit messaging.

use crate::transport::{DeviceTransport, ItemResult};
use async_trait::async_trait;
use eipua_core::{DeviceProfile, ProtocolError, TransportError, Value};
use rust_ethernet_ip::{EipClient, EtherNetIpError, PlcValue};
use tracing::debug;

pub struct EnipDevice {
    client: Option<EipClient>,
    /// Tag read as a liveness probe.
    heartbeat_path: String,
}

impl EnipDevice {
    pub fn new(heartbeat_path: impl Into<String>) -> Self {
        Self {
            client: None,
            heartbeat_path: heartbeat_path.into(),
        }
    }

    /// Probe liveness through the profile's first tag.
    pub fn for_profile(profile: &DeviceProfile) -> Self {
        let path = profile
            .tags()
            .first()
            .map(|tag| tag.device_address_path.clone())
            .unwrap_or_default();
        Self::new(path)
    }

    fn client(&mut self) -> Result<&mut EipClient, TransportError> {
        self.client.as_mut().ok_or(TransportError::NotConnected)
    }
}

fn is_transport(err: &EtherNetIpError) -> bool {
    matches!(err, EtherNetIpError::Io(_))
}

fn to_value(path: &str, value: PlcValue) -> ItemResult<Value> {
    Ok(match value {
        PlcValue::Bool(v) => Value::Bool(v),
        PlcValue::Sint(v) => Value::Int(v as i64),
        PlcValue::Int(v) => Value::Int(v as i64),
        PlcValue::Dint(v) => Value::Int(v as i64),
        PlcValue::Lint(v) => Value::Int(v),
        PlcValue::Usint(v) => Value::Int(v as i64),
        PlcValue::Uint(v) => Value::Int(v as i64),
        PlcValue::Udint(v) => Value::Int(v as i64),
        PlcValue::Real(v) => Value::Float(v as f64),
        PlcValue::Lreal(v) => Value::Float(v),
        PlcValue::String(v) => Value::String(v),
        other => {
            return Err(ProtocolError::unsupported(
                path,
                format!("unsupported CIP value {other:?}"),
            ))
        }
    })
}

#[async_trait]
impl DeviceTransport for EnipDevice {
    async fn connect(&mut self, endpoint: &str) -> Result<(), TransportError> {
        let client = EipClient::connect(endpoint)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        self.client = Some(client);
        Ok(())
    }

    async fn read_batch(&mut self, paths: &[String]) -> Result<Vec<ItemResult<Value>>, TransportError> {
        let client = self.client()?;
        let mut values = Vec::with_capacity(paths.len());
        for path in paths {
            match client.read_tag(path).await {
                Ok(value) => values.push(to_value(path, value)),
                Err(e) if is_transport(&e) => return Err(TransportError::Io(e.to_string())),
                Err(e) => {
                    debug!(path = %path, error = %e, "CIP read rejected");
                    values.push(Err(ProtocolError::new(path, e.to_string())));
                }
            }
        }
        Ok(values)
    }

    async fn heartbeat(&mut self) -> Result<(), TransportError> {
        let path = self.heartbeat_path.clone();
        let client = self.client()?;
        client
            .read_tag(&path)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        // Dropping the client closes the encapsulation session socket.
        self.client = None;
        Ok(())
    }
}

//! Server transport over the synchronous `opcua` client.
//!
//! Every service call runs on the blocking pool; the caller bounds it with a
//! deadline, so a wedged session only costs a blocking thread.

use crate::transport::{EnsureOutcome, ItemResult, NodeSpec, NodeWrite, ServerTransport};
use async_trait::async_trait;
use eipua_core::{DataKind, ProtocolError, Quality, TransportError, Value};
use opcua::client::prelude::*;
use opcua::sync::RwLock;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// 100 ns ticks between 1601-01-01 and the Unix epoch.
const UNIX_EPOCH_TICKS: i64 = 116_444_736_000_000_000;
/// `Server_ServerStatus_State`
const SERVER_STATE_NODE: u32 = 2259;

pub struct OpcUaClientTransport {
    application_name: String,
    parent_folder: NodeId,
    session: Option<Arc<RwLock<Session>>>,
}

impl OpcUaClientTransport {
    pub fn new(application_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            parent_folder: NodeId::objects_folder_id(),
            session: None,
        }
    }

    fn session(&self) -> Result<Arc<RwLock<Session>>, TransportError> {
        self.session.clone().ok_or(TransportError::NotConnected)
    }
}

async fn blocking<T, F>(f: F) -> Result<T, TransportError>
where
    F: FnOnce() -> Result<T, StatusCode> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?
        .map_err(status_to_transport)
}

fn status_to_transport(status: StatusCode) -> TransportError {
    if status == StatusCode::BadTimeout {
        TransportError::Timeout {
            op: "opc ua service call",
            after: std::time::Duration::ZERO,
        }
    } else {
        TransportError::Io(status.to_string())
    }
}

fn parse_node_id(node_id: &str) -> ItemResult<NodeId> {
    NodeId::from_str(node_id).map_err(|_| ProtocolError::new(node_id, "BadNodeIdInvalid"))
}

fn variant(value: &Value) -> Variant {
    match value {
        Value::Bool(v) => Variant::Boolean(*v),
        Value::Int(v) => Variant::Int64(*v),
        Value::Float(v) => Variant::Double(*v),
        Value::String(v) => Variant::String(UAString::from(v.as_str())),
        Value::Array(values) => Variant::from(values.clone()),
    }
}

fn data_type(kind: DataKind) -> DataTypeId {
    match kind {
        DataKind::Int => DataTypeId::Int64,
        DataKind::Float | DataKind::Array => DataTypeId::Double,
        DataKind::Bool => DataTypeId::Boolean,
        DataKind::String => DataTypeId::String,
    }
}

fn status_for(quality: Quality) -> StatusCode {
    match quality {
        Quality::Good => StatusCode::Good,
        Quality::Stale => StatusCode::UncertainLastUsableValue,
        Quality::Bad => StatusCode::BadNoCommunication,
    }
}

fn timestamp(unix_us: u64) -> DateTime {
    DateTime::from(UNIX_EPOCH_TICKS + (unix_us as i64).saturating_mul(10))
}

fn read_attribute(node_id: NodeId, attribute: AttributeId) -> ReadValueId {
    ReadValueId {
        node_id,
        attribute_id: attribute as u32,
        index_range: UAString::null(),
        data_encoding: QualifiedName::null(),
    }
}

fn add_node_item(parent: &NodeId, node_id: NodeId, spec: &NodeSpec) -> AddNodesItem {
    let attributes = VariableAttributes {
        specified_attributes: 0,
        display_name: LocalizedText::new("", &spec.browse_name),
        description: LocalizedText::new("", &spec.browse_name),
        write_mask: 0,
        user_write_mask: 0,
        value: Variant::Empty,
        data_type: data_type(spec.kind).into(),
        value_rank: if spec.kind == DataKind::Array { 1 } else { -1 },
        array_dimensions: None,
        access_level: (AccessLevel::CURRENT_READ | AccessLevel::CURRENT_WRITE).bits(),
        user_access_level: (UserAccessLevel::CURRENT_READ | UserAccessLevel::CURRENT_WRITE).bits(),
        minimum_sampling_interval: 0.0,
        historizing: false,
    };
    AddNodesItem {
        parent_node_id: parent.clone().into(),
        reference_type_id: ReferenceTypeId::Organizes.into(),
        requested_new_node_id: node_id.into(),
        browse_name: QualifiedName::new(0, spec.browse_name.as_str()),
        node_class: NodeClass::Variable,
        node_attributes: ExtensionObject::from_encodable(
            ObjectId::VariableAttributes_Encoding_DefaultBinary,
            &attributes,
        ),
        type_definition: VariableTypeId::BaseDataVariableType.into(),
    }
}

#[async_trait]
impl ServerTransport for OpcUaClientTransport {
    async fn connect(&mut self, endpoint: &str) -> Result<(), TransportError> {
        let endpoint = endpoint.to_string();
        let application_name = self.application_name.clone();
        let session = blocking(move || {
            let mut client = ClientBuilder::new()
                .application_name(application_name.as_str())
                .application_uri("urn:eipua:gateway")
                .create_sample_keypair(true)
                .trust_server_certs(true)
                .session_retry_limit(0)
                .client()
                .ok_or(StatusCode::BadConfigurationError)?;
            let endpoint: EndpointDescription = (
                endpoint.as_str(),
                SecurityPolicy::None.to_str(),
                MessageSecurityMode::None,
                UserTokenPolicy::anonymous(),
            )
                .into();
            client.connect_to_endpoint(endpoint, IdentityToken::Anonymous)
        })
        .await?;
        self.session = Some(session);
        Ok(())
    }

    async fn ensure_nodes(
        &mut self,
        nodes: &[NodeSpec],
    ) -> Result<Vec<ItemResult<EnsureOutcome>>, TransportError> {
        let session = self.session()?;
        let parent = self.parent_folder.clone();
        let nodes = nodes.to_vec();
        blocking(move || {
            let session = session.read();
            let mut outcomes = Vec::with_capacity(nodes.len());
            for spec in &nodes {
                let node_id = match parse_node_id(&spec.node_id) {
                    Ok(id) => id,
                    Err(e) => {
                        outcomes.push(Err(e));
                        continue;
                    }
                };
                let probe = session.read(
                    &[read_attribute(node_id.clone(), AttributeId::NodeClass)],
                    TimestampsToReturn::Neither,
                    0.0,
                )?;
                let exists = probe
                    .first()
                    .map_or(false, |dv| dv.status.map_or(true, |s| s.is_good()));
                if exists {
                    outcomes.push(Ok(EnsureOutcome::Existing));
                    continue;
                }

                let added = session.add_nodes(&[add_node_item(&parent, node_id, spec)])?;
                let status = added
                    .first()
                    .map(|r| r.status_code)
                    .unwrap_or(StatusCode::BadUnexpectedError);
                if status.is_good() || status == StatusCode::BadNodeIdExists {
                    outcomes.push(Ok(EnsureOutcome::Created));
                } else {
                    outcomes.push(Err(ProtocolError::new(&spec.node_id, status.to_string())));
                }
            }
            Ok(outcomes)
        })
        .await
    }

    async fn write(&mut self, writes: &[NodeWrite]) -> Result<Vec<ItemResult<()>>, TransportError> {
        let session = self.session()?;
        let writes = writes.to_vec();
        blocking(move || {
            let mut results: Vec<Option<ItemResult<()>>> = vec![None; writes.len()];
            let mut batch = Vec::with_capacity(writes.len());
            let mut index = Vec::with_capacity(writes.len());
            for (i, w) in writes.iter().enumerate() {
                match parse_node_id(&w.node_id) {
                    Ok(node_id) => {
                        let ts = timestamp(w.source_timestamp_us);
                        batch.push(WriteValue {
                            node_id,
                            attribute_id: AttributeId::Value as u32,
                            index_range: UAString::null(),
                            value: DataValue {
                                value: w.value.as_ref().map(variant),
                                status: Some(status_for(w.quality)),
                                source_timestamp: Some(ts),
                                source_picoseconds: None,
                                server_timestamp: None,
                                server_picoseconds: None,
                            },
                        });
                        index.push(i);
                    }
                    Err(e) => results[i] = Some(Err(e)),
                }
            }

            if !batch.is_empty() {
                let statuses = session.read().write(&batch)?;
                for (slot, status) in index.iter().zip(statuses.into_iter()) {
                    results[*slot] = Some(if status.is_good() {
                        Ok(())
                    } else {
                        Err(ProtocolError::new(&writes[*slot].node_id, status.to_string()))
                    });
                }
            }
            debug!(writes = writes.len(), "OPC UA write complete");
            Ok(results
                .into_iter()
                .enumerate()
                .map(|(i, r)| {
                    r.unwrap_or_else(|| Err(ProtocolError::new(&writes[i].node_id, "no status returned")))
                })
                .collect())
        })
        .await
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        let session = self.session()?;
        blocking(move || {
            let values = session.read().read(
                &[read_attribute(
                    NodeId::new(0u16, SERVER_STATE_NODE),
                    AttributeId::Value,
                )],
                TimestampsToReturn::Neither,
                0.0,
            )?;
            match values.first().and_then(|dv| dv.status) {
                Some(status) if !status.is_good() => Err(status),
                _ => Ok(()),
            }
        })
        .await
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(session) = self.session.take() {
            blocking(move || {
                session.read().disconnect();
                Ok(())
            })
            .await?;
        }
        Ok(())
    }
}

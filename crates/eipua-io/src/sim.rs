//! In-memory device and server used by tests and `--simulate`.
//!
//! Both are cheap to clone: every clone shares one state behind a mutex, so a
//! test can keep a handle to inject failures while the engine owns another.

use crate::transport::{
    DeviceTransport, EnsureOutcome, ItemResult, NodeSpec, NodeWrite, ServerTransport,
};
use async_trait::async_trait;
use eipua_core::{DataKind, DeviceProfile, ProtocolError, TransportError, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Simulated device
// ============================================================================

#[derive(Debug)]
struct DeviceState {
    reachable: bool,
    heartbeat_ok: bool,
    connected: bool,
    hang_disconnect: bool,
    read_delay: Duration,
    max_batch: usize,
    tick: u64,
    kinds: HashMap<String, DataKind>,
    fixed: HashMap<String, Value>,
    unsupported: HashSet<String>,
    connects: usize,
    disconnects: usize,
    reads: usize,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            reachable: true,
            heartbeat_ok: true,
            connected: false,
            hang_disconnect: false,
            read_delay: Duration::ZERO,
            max_batch: usize::MAX,
            tick: 0,
            kinds: HashMap::new(),
            fixed: HashMap::new(),
            unsupported: HashSet::new(),
            connects: 0,
            disconnects: 0,
            reads: 0,
        }
    }
}

impl DeviceState {
    fn sample(&self, path: &str) -> Value {
        if let Some(value) = self.fixed.get(path) {
            return value.clone();
        }
        let tick = self.tick;
        match self.kinds.get(path) {
            // Raw counts; the profile's scale turns them into engineering units.
            Some(DataKind::Float) => Value::Int((tick % 1000) as i64),
            Some(DataKind::Bool) => Value::Bool(tick % 2 == 0),
            Some(DataKind::String) => Value::String("okay".to_string()),
            Some(DataKind::Array) => Value::Array(vec![tick as f64; 4]),
            Some(DataKind::Int) | None => Value::Int(tick as i64),
        }
    }
}

/// Simulated CIP device. Every path answers unless marked unsupported.
#[derive(Debug, Clone, Default)]
pub struct SimDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl SimDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device that answers every tag of `profile` with a value of its kind.
    pub fn for_profile(profile: &DeviceProfile) -> Self {
        let device = Self::new();
        {
            let mut state = lock(&device.state);
            for tag in profile.tags() {
                state
                    .kinds
                    .insert(tag.device_address_path.clone(), tag.data_kind);
            }
        }
        device
    }

    pub fn set_value(&self, path: &str, value: Value) {
        lock(&self.state).fixed.insert(path.to_string(), value);
    }

    pub fn set_unsupported(&self, path: &str) {
        lock(&self.state).unsupported.insert(path.to_string());
    }

    /// An unreachable device refuses connects and drops an open session.
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = lock(&self.state);
        state.reachable = reachable;
        if !reachable {
            state.connected = false;
        }
    }

    pub fn set_heartbeat_ok(&self, ok: bool) {
        lock(&self.state).heartbeat_ok = ok;
    }

    pub fn set_read_delay(&self, delay: Duration) {
        lock(&self.state).read_delay = delay;
    }

    pub fn set_max_batch(&self, max: usize) {
        lock(&self.state).max_batch = max;
    }

    pub fn set_hang_disconnect(&self, hang: bool) {
        lock(&self.state).hang_disconnect = hang;
    }

    pub fn connects(&self) -> usize {
        lock(&self.state).connects
    }

    pub fn disconnects(&self) -> usize {
        lock(&self.state).disconnects
    }

    pub fn reads(&self) -> usize {
        lock(&self.state).reads
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }
}

#[async_trait]
impl DeviceTransport for SimDevice {
    async fn connect(&mut self, endpoint: &str) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.connects += 1;
        if !state.reachable {
            return Err(TransportError::Io(format!("{endpoint}: connection refused")));
        }
        state.connected = true;
        Ok(())
    }

    async fn read_batch(&mut self, paths: &[String]) -> Result<Vec<ItemResult<Value>>, TransportError> {
        let delay = lock(&self.state).read_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        if !state.connected {
            return Err(TransportError::Closed);
        }
        state.reads += 1;
        state.tick += 1;
        Ok(paths
            .iter()
            .map(|path| {
                if state.unsupported.contains(path) {
                    Err(ProtocolError::unsupported(path, "attribute not supported"))
                } else {
                    Ok(state.sample(path))
                }
            })
            .collect())
    }

    async fn heartbeat(&mut self) -> Result<(), TransportError> {
        let state = lock(&self.state);
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if !state.heartbeat_ok {
            return Err(TransportError::Io("identity object read failed".to_string()));
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let hang = {
            let mut state = lock(&self.state);
            state.disconnects += 1;
            state.hang_disconnect
        };
        if hang {
            std::future::pending::<()>().await;
        }
        lock(&self.state).connected = false;
        Ok(())
    }

    fn max_batch(&self) -> usize {
        lock(&self.state).max_batch
    }
}

// ============================================================================
// Simulated OPC UA server
// ============================================================================

/// Most recent accepted writes kept by [`SimServer::history`].
pub const HISTORY_LIMIT: usize = 1024;

#[derive(Debug)]
struct ServerState {
    reachable: bool,
    ping_ok: bool,
    connected: bool,
    nodes: BTreeMap<String, DataKind>,
    values: HashMap<String, NodeWrite>,
    creations: HashMap<String, usize>,
    history: VecDeque<NodeWrite>,
    accepted_writes: usize,
    failing: HashSet<String>,
    write_calls: usize,
    connects: usize,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            reachable: true,
            ping_ok: true,
            connected: false,
            nodes: BTreeMap::new(),
            values: HashMap::new(),
            creations: HashMap::new(),
            history: VecDeque::with_capacity(HISTORY_LIMIT),
            accepted_writes: 0,
            failing: HashSet::new(),
            write_calls: 0,
            connects: 0,
        }
    }
}

/// Simulated OPC UA server with an address space keyed by node id.
#[derive(Debug, Clone, Default)]
pub struct SimServer {
    state: Arc<Mutex<ServerState>>,
}

impl SimServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        let mut state = lock(&self.state);
        state.reachable = reachable;
        if !reachable {
            state.connected = false;
        }
    }

    pub fn set_ping_ok(&self, ok: bool) {
        lock(&self.state).ping_ok = ok;
    }

    /// Reject writes to `node_id` with a per-node status.
    pub fn fail_writes_to(&self, node_id: &str) {
        lock(&self.state).failing.insert(node_id.to_string());
    }

    /// Server restart: the session drops and the address space is wiped.
    pub fn lose_state(&self) {
        let mut state = lock(&self.state);
        state.connected = false;
        state.nodes.clear();
        state.values.clear();
    }

    pub fn has_node(&self, node_id: &str) -> bool {
        lock(&self.state).nodes.contains_key(node_id)
    }

    pub fn node_count(&self) -> usize {
        lock(&self.state).nodes.len()
    }

    /// How many times `node_id` has been created.
    pub fn creations(&self, node_id: &str) -> usize {
        lock(&self.state).creations.get(node_id).copied().unwrap_or(0)
    }

    pub fn value(&self, node_id: &str) -> Option<NodeWrite> {
        lock(&self.state).values.get(node_id).cloned()
    }

    /// The last [`HISTORY_LIMIT`] accepted writes, oldest first.
    pub fn history(&self) -> Vec<NodeWrite> {
        lock(&self.state).history.iter().cloned().collect()
    }

    /// Accepted node writes over the server's lifetime.
    pub fn accepted_writes(&self) -> usize {
        lock(&self.state).accepted_writes
    }

    pub fn write_calls(&self) -> usize {
        lock(&self.state).write_calls
    }

    pub fn connects(&self) -> usize {
        lock(&self.state).connects
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }
}

#[async_trait]
impl ServerTransport for SimServer {
    async fn connect(&mut self, endpoint: &str) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.connects += 1;
        if !state.reachable {
            return Err(TransportError::Io(format!("{endpoint}: BadCommunicationError")));
        }
        state.connected = true;
        Ok(())
    }

    async fn ensure_nodes(
        &mut self,
        nodes: &[NodeSpec],
    ) -> Result<Vec<ItemResult<EnsureOutcome>>, TransportError> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        Ok(nodes
            .iter()
            .map(|node| {
                if node.node_id.is_empty() {
                    return Err(ProtocolError::new(&node.browse_name, "BadNodeIdInvalid"));
                }
                if state.nodes.contains_key(&node.node_id) {
                    Ok(EnsureOutcome::Existing)
                } else {
                    state.nodes.insert(node.node_id.clone(), node.kind);
                    *state.creations.entry(node.node_id.clone()).or_default() += 1;
                    Ok(EnsureOutcome::Created)
                }
            })
            .collect())
    }

    async fn write(&mut self, writes: &[NodeWrite]) -> Result<Vec<ItemResult<()>>, TransportError> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(TransportError::Closed);
        }
        state.write_calls += 1;
        Ok(writes
            .iter()
            .map(|write| {
                if !state.nodes.contains_key(&write.node_id) {
                    return Err(ProtocolError::new(&write.node_id, "BadNodeIdUnknown"));
                }
                if state.failing.contains(&write.node_id) {
                    return Err(ProtocolError::new(&write.node_id, "BadNotWritable"));
                }
                state.values.insert(write.node_id.clone(), write.clone());
                if state.history.len() == HISTORY_LIMIT {
                    state.history.pop_front();
                }
                state.history.push_back(write.clone());
                state.accepted_writes += 1;
                Ok(())
            })
            .collect())
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        let state = lock(&self.state);
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if !state.ping_ok {
            return Err(TransportError::Timeout {
                op: "server status read",
                after: Duration::ZERO,
            });
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        lock(&self.state).connected = false;
        Ok(())
    }
}

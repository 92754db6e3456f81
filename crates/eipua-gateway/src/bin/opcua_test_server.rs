//! Local OPC UA server exposing a writable variable for every node in a
//! device profile, for bench runs of the gateway without a historian.
//!
//! Accepts the gateway's `--profile`, `--opcua-endpoint`, `--opcua-namespace`
//! and `--watchdog-node` flags.

#[cfg(feature = "opcua")]
mod server {
    use eipua_core::{DataKind, DeviceProfile};
    use eipua_gateway::runtime::RuntimeConfig;
    use opcua::server::address_space::{AccessLevel, UserAccessLevel};
    use opcua::server::config::{ServerEndpoint, ANONYMOUS_USER_TOKEN_ID};
    use opcua::server::prelude::*;
    use std::str::FromStr;
    use tracing::{info, warn};

    fn parse_endpoint(endpoint: &str) -> (String, u16) {
        let trimmed = endpoint.trim();
        let without_scheme = trimmed.strip_prefix("opc.tcp://").unwrap_or(trimmed);
        let mut parts = without_scheme.split('/').next().unwrap_or("").split(':');
        let host = parts.next().unwrap_or("0.0.0.0").to_string();
        let port = parts
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(4840);
        (host, port)
    }

    fn variable(node_id: &NodeId, name: &str, kind: DataKind) -> Variable {
        let builder = VariableBuilder::new(node_id, name, name)
            .access_level(AccessLevel::CURRENT_READ | AccessLevel::CURRENT_WRITE)
            .user_access_level(UserAccessLevel::CURRENT_READ | UserAccessLevel::CURRENT_WRITE);
        match kind {
            DataKind::Int => builder.data_type(DataTypeId::Int64).value(0i64),
            DataKind::Float => builder.data_type(DataTypeId::Double).value(0.0),
            DataKind::Bool => builder.data_type(DataTypeId::Boolean).value(false),
            DataKind::String => builder.data_type(DataTypeId::String).value(""),
            DataKind::Array => builder
                .data_type(DataTypeId::Double)
                .value_rank(1)
                .value(Vec::<f64>::new()),
        }
        .build()
    }

    pub fn run(config: RuntimeConfig, profile: DeviceProfile) {
        let (host, port) = parse_endpoint(&config.opcua_endpoint);
        let anonymous = vec![ANONYMOUS_USER_TOKEN_ID.to_string()];
        let server_config = ServerBuilder::new()
            .application_name("eipua test server")
            .application_uri(config.opcua_namespace.as_str())
            .product_uri(config.opcua_namespace.as_str())
            .create_sample_keypair(true)
            .pki_dir("./pki-test-server")
            .host_and_port(host, port)
            .endpoints(vec![("none", ServerEndpoint::new_none("/", &anonymous))])
            .discovery_urls(vec!["/".to_string()])
            .config();

        let server = Server::new(server_config);
        {
            let address_space = server.address_space();
            let mut space = address_space.write();
            let ns = space
                .register_namespace(&config.opcua_namespace)
                .unwrap_or_else(|_| space.default_namespace());
            let folder = space
                .add_folder("EIPUA", "EIPUA", &NodeId::objects_folder_id())
                .unwrap_or_else(|_| NodeId::objects_folder_id());
            info!(namespace = ns, uri = %config.opcua_namespace, "Registered namespace");

            let mut nodes: Vec<(String, String, DataKind)> = profile
                .tags()
                .iter()
                .map(|tag| (tag.opc_node_id.clone(), tag.name.clone(), tag.published_kind()))
                .collect();
            if let Some(watchdog) = &config.watchdog_node {
                nodes.push((watchdog.clone(), "WATCHDOG".to_string(), DataKind::Bool));
            }

            let mut variables = Vec::with_capacity(nodes.len());
            for (node_id, name, kind) in &nodes {
                match NodeId::from_str(node_id) {
                    Ok(id) => variables.push(variable(&id, name, *kind)),
                    Err(_) => warn!(node_id = %node_id, "Skipping unparsable node id"),
                }
            }
            info!(variables = variables.len(), "Exposing profile nodes");
            space.add_variables(variables, &folder);
        }

        info!(endpoint = %config.opcua_endpoint, "OPC UA test server running");
        server.run();
    }
}

#[cfg(feature = "opcua")]
fn main() -> std::process::ExitCode {
    use eipua_gateway::runtime::RuntimeConfig;
    use std::process::ExitCode;

    tracing_subscriber::fmt().init();
    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(2);
        }
    };
    let Some(path) = config.profile_path.clone() else {
        eprintln!("error: --profile (or EIPUA_PROFILE) is required");
        return ExitCode::from(2);
    };
    let profile = match eipua_io::load_profile(&path) {
        Ok(profile) => profile,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(2);
        }
    };
    server::run(config, profile);
    ExitCode::SUCCESS
}

#[cfg(not(feature = "opcua"))]
fn main() -> std::process::ExitCode {
    eprintln!("opcua-test-server was built without the `opcua` feature");
    std::process::ExitCode::FAILURE
}

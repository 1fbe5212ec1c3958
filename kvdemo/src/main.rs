//! Sample key-value chaincode.
//!
//! Demonstrates the shim surface end to end: state reads and writes, range
//! scans, key history, and events. Configuration comes from the two
//! environment variables a peer conventionally sets for a hosted
//! chaincode: `CORE_PEER_ADDRESS` and `CORE_CHAINCODE_ID_NAME`
//! (`name:version`).

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use libshim::{start, Chaincode, ChaincodeStub, Response, ShimConfig};
use tracing::{info, instrument};

struct KvChaincode;

impl KvChaincode {
    async fn put(&self, stub: &ChaincodeStub, params: &[String]) -> Response {
        let [key, value] = params else {
            return Response::error("usage: put <key> <value>");
        };
        match stub.put_state(key, value.clone().into_bytes()).await {
            Ok(()) => {
                let _ = stub.set_event("kv-put", key.clone().into_bytes());
                Response::success(Vec::new())
            }
            Err(e) => Response::error(format!("put {key}: {e}")),
        }
    }

    async fn get(&self, stub: &ChaincodeStub, params: &[String]) -> Response {
        let [key] = params else {
            return Response::error("usage: get <key>");
        };
        match stub.get_state(key).await {
            Ok(Some(value)) => Response::success(value),
            Ok(None) => Response::error(format!("key {key} not found")),
            Err(e) => Response::error(format!("get {key}: {e}")),
        }
    }

    async fn delete(&self, stub: &ChaincodeStub, params: &[String]) -> Response {
        let [key] = params else {
            return Response::error("usage: delete <key>");
        };
        match stub.delete_state(key).await {
            Ok(()) => Response::success(Vec::new()),
            Err(e) => Response::error(format!("delete {key}: {e}")),
        }
    }

    /// List keys in `[start, end)` as a JSON array.
    async fn keys(&self, stub: &ChaincodeStub, params: &[String]) -> Response {
        let [start, end] = params else {
            return Response::error("usage: keys <start> <end>");
        };
        let mut it = match stub.get_state_by_range(start, end).await {
            Ok(it) => it,
            Err(e) => return Response::error(format!("range scan: {e}")),
        };
        let mut keys = Vec::new();
        loop {
            match it.next().await {
                Ok(Some(record)) => keys.push(record.key),
                Ok(None) => break,
                Err(e) => return Response::error(format!("range scan: {e}")),
            }
        }
        match serde_json::to_vec(&keys) {
            Ok(body) => Response::success(body),
            Err(e) => Response::error(format!("encode keys: {e}")),
        }
    }

    /// List a key's write history as a JSON array of `{tx_id, is_delete}`.
    async fn history(&self, stub: &ChaincodeStub, params: &[String]) -> Response {
        let [key] = params else {
            return Response::error("usage: history <key>");
        };
        let mut it = match stub.get_history_for_key(key).await {
            Ok(it) => it,
            Err(e) => return Response::error(format!("history {key}: {e}")),
        };
        let mut entries = Vec::new();
        loop {
            match it.next().await {
                Ok(Some(m)) => entries.push(serde_json::json!({
                    "tx_id": m.tx_id,
                    "is_delete": m.is_delete,
                })),
                Ok(None) => break,
                Err(e) => return Response::error(format!("history {key}: {e}")),
            }
        }
        match serde_json::to_vec(&entries) {
            Ok(body) => Response::success(body),
            Err(e) => Response::error(format!("encode history: {e}")),
        }
    }
}

#[async_trait]
impl Chaincode for KvChaincode {
    #[instrument(skip_all, fields(tx = %stub.get_tx_id()))]
    async fn init(&self, stub: ChaincodeStub) -> Response {
        info!("kvdemo initialized");
        Response::success(Vec::new())
    }

    #[instrument(skip_all, fields(tx = %stub.get_tx_id()))]
    async fn invoke(&self, stub: ChaincodeStub) -> Response {
        let (function, params) = stub.get_function_and_parameters();
        match function.as_str() {
            "put" => self.put(&stub, &params).await,
            "get" => self.get(&stub, &params).await,
            "delete" => self.delete(&stub, &params).await,
            "keys" => self.keys(&stub, &params).await,
            "history" => self.history(&stub, &params).await,
            other => Response::error(format!("unknown function '{other}'")),
        }
    }
}

fn config_from_env() -> Result<ShimConfig> {
    let endpoint =
        std::env::var("CORE_PEER_ADDRESS").context("CORE_PEER_ADDRESS must be set")?;
    let id =
        std::env::var("CORE_CHAINCODE_ID_NAME").context("CORE_CHAINCODE_ID_NAME must be set")?;
    let Some((name, version)) = id.split_once(':') else {
        bail!("CORE_CHAINCODE_ID_NAME must be of the form name:version, got '{id}'");
    };
    Ok(ShimConfig::new(endpoint, name, version))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = config_from_env()?;
    info!(endpoint = %config.endpoint, chaincode = %config.chaincode_name, "starting kvdemo");
    start(Arc::new(KvChaincode), &config)
        .await
        .context("shim stopped")?;
    Ok(())
}

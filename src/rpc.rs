//! JSON-RPC client for the chain daemon.
use std::time::Duration;

use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::{
    config::Settings,
    error::{EngineError, Result},
};

/// Timeout for calls that only feed status reports.
pub const STATUS_TIMEOUT: Duration = Duration::from_millis(500);
const CALL_TIMEOUT: Duration = Duration::from_secs(60);
/// `createwallet` error when the wallet directory already exists.
const WALLET_EXISTS: i64 = -4;
/// `loadwallet` error when the wallet is already loaded.
const WALLET_ALREADY_LOADED: i64 = -35;

#[derive(Debug, Clone)]
pub struct ChainRpc {
    client: Client,
    url: String,
    wallet: String,
    user: String,
    password: String,
}

impl ChainRpc {
    pub fn new(settings: &Settings) -> Result<Self> {
        Self::with_timeout(settings, CALL_TIMEOUT)
    }

    pub fn with_timeout(settings: &Settings, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: settings.rpc_url(),
            wallet: settings.bitcoind.wallet.clone(),
            user: settings.bitcoind.rpc_user.clone(),
            password: settings.bitcoind.rpc_password.clone(),
        })
    }

    fn wallet_url(&self) -> String {
        format!("{}/wallet/{}", self.url, self.wallet)
    }

    fn call_at<T: DeserializeOwned>(&self, url: &str, method: &str, params: Value) -> Result<T> {
        debug!("RPC {method} {params}");
        let body = json!({
            "jsonrpc": "1.0",
            "id": "isomer",
            "method": method,
            "params": params,
        });
        let response: Value = self
            .client
            .post(url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()?
            .json()?;

        if let Some(error) = response.get("error").filter(|error| !error.is_null()) {
            return Err(EngineError::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            });
        }

        let result = response.get("result").cloned().unwrap_or(Value::Null);
        Ok(serde_json::from_value(result)?)
    }

    /// Calls `method` on the node endpoint.
    pub fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        self.call_at(&self.url, method, params)
    }

    /// Calls `method` on the dev wallet endpoint.
    pub fn wallet_call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        self.call_at(&self.wallet_url(), method, params)
    }

    pub fn block_count(&self) -> Result<u64> {
        self.call("getblockcount", json!([]))
    }

    pub fn mempool_size(&self) -> Result<u64> {
        let info: Value = self.call("getmempoolinfo", json!([]))?;
        Ok(info.get("size").and_then(Value::as_u64).unwrap_or(0))
    }

    pub fn new_address(&self) -> Result<String> {
        self.wallet_call("getnewaddress", json!(["", "bech32m"]))
    }

    /// Mines `count` blocks and returns their hashes.
    pub fn generate_to_address(&self, count: u32, address: &str) -> Result<Vec<String>> {
        self.call("generatetoaddress", json!([count, address]))
    }

    pub fn send_to_address(&self, address: &str, amount_btc: f64) -> Result<String> {
        self.wallet_call("sendtoaddress", json!([address, amount_btc]))
    }

    /// Creates the dev wallet if needed and makes sure it is loaded.
    pub fn ensure_wallet(&self) -> Result<()> {
        let loaded: Vec<String> = self.call("listwallets", json!([]))?;
        if loaded.iter().any(|name| name == &self.wallet) {
            return Ok(());
        }

        match self.call::<Value>("createwallet", json!([self.wallet])) {
            Ok(_) => {
                info!("Created wallet '{}'", self.wallet);
                return Ok(());
            }
            Err(EngineError::Rpc { code, .. }) if code == WALLET_EXISTS => {}
            Err(err) => return Err(err),
        }

        match self.call::<Value>("loadwallet", json!([self.wallet])) {
            Ok(_) => Ok(()),
            Err(EngineError::Rpc { code, .. }) if code == WALLET_ALREADY_LOADED => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Mines up to `target_height` so coinbase outputs are spendable.
    /// Returns the number of blocks mined.
    pub fn bootstrap(&self, target_height: u64) -> Result<u64> {
        self.ensure_wallet()?;
        let height = self.block_count()?;
        if height >= target_height {
            debug!("Chain already at height {height}; skipping initial mining");
            return Ok(0);
        }

        let missing = target_height - height;
        let address = self.new_address()?;
        let mut mined = 0;
        while mined < missing {
            let batch = (missing - mined).min(u64::from(u32::MAX)) as u32;
            mined += self.generate_to_address(batch, &address)?.len() as u64;
            if batch > 0 && mined == 0 {
                break;
            }
        }
        info!("Mined {mined} blocks to {address}");
        Ok(mined)
    }
}

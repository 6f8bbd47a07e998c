pub mod analyze;
pub mod status;
pub mod warm_audio;

use anyhow::Result;
use bridge::client::BridgeClient;

/// Connection settings shared by every command.
#[derive(Debug, Clone)]
pub struct Context {
    pub bridge_url: String,
    pub api_key: Option<String>,
    pub frontend_url: String,
}

impl Context {
    pub fn client(&self) -> Result<BridgeClient> {
        Ok(BridgeClient::new(&self.bridge_url, self.api_key.as_deref())?)
    }

    /// Reader URL that opens an analysed document.
    pub fn reader_url(&self, hash: &str) -> String {
        format!("{}/?bridgeHash={}", self.frontend_url.trim_end_matches('/'), hash)
    }
}

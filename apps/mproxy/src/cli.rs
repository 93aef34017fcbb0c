use clap::Parser;

use mproxy_common::{parse_service_list, Config};

#[derive(Parser)]
#[command(name = "mproxy", about = "Multi-provider AI API proxy")]
pub(crate) struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    pub(crate) host: String,
    #[arg(long, default_value_t = 8317)]
    pub(crate) port: u16,
    /// Inbound API key; repeat for several.
    #[arg(long = "api-key")]
    pub(crate) api_keys: Vec<String>,
    /// Directory holding one JSON auth record per upstream identity.
    #[arg(long, default_value = "auths")]
    pub(crate) auth_dir: String,
    /// Outbound proxy URL (socks5:// or http(s)://).
    #[arg(long)]
    pub(crate) proxy: Option<String>,
    /// Comma-separated service allowlist for the outbound proxy.
    #[arg(long)]
    pub(crate) proxy_services: Option<String>,
    #[arg(long, default_value_t = false)]
    pub(crate) debug: bool,
}

impl Cli {
    /// CLI over ENV over defaults; `Config::apply_env` fills whatever the
    /// flags left unset.
    pub(crate) fn into_config(self) -> Config {
        let mut config = Config {
            host: self.host,
            port: self.port,
            api_keys: self.api_keys,
            auth_dir: self.auth_dir,
            proxy_url: self.proxy,
            proxy_services: self
                .proxy_services
                .as_deref()
                .map(parse_service_list)
                .unwrap_or_default(),
            debug: self.debug,
            ..Config::default()
        };
        config.apply_env();
        config
    }
}

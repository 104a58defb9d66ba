use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use std::collections::BTreeSet;
use std::sync::Arc;
use sysinfo::Networks;
use tracing::debug;

use super::{ConnectivitySource, InterfaceKind};

/// Maps OS interface names onto [`InterfaceKind`]s.
pub struct InterfaceClassifier {
    loopback: Regex,
    wifi: Regex,
    cellular: Regex,
    vpn: Regex,
    ethernet: Regex,
}

impl InterfaceClassifier {
    pub fn new() -> Result<Self, regex::Error> {
        let build = |pattern: &str| RegexBuilder::new(pattern).case_insensitive(true).build();
        Ok(Self {
            loopback: build(r"^(lo\d*|loopback.*)$")?,
            wifi: build(r"^(wl|wlan|wlp|ath\d|ra\d)|wi-?fi|wireless")?,
            cellular: build(r"^(wwan|rmnet|pdp_ip|ccmni|ppp_cell)|mobile|cellular")?,
            vpn: build(r"^(tun|tap|utun|wg|ppp|ipsec|gpd)\d*")?,
            ethernet: build(r"^(eth|en|em)|ethernet")?,
        })
    }

    /// `None` for loopback interfaces, which never count as connectivity.
    pub fn classify(&self, name: &str) -> Option<InterfaceKind> {
        if self.loopback.is_match(name) {
            return None;
        }
        // Cellular before VPN: `ppp_cell*` also matches the generic `ppp` prefix.
        let kind = if self.wifi.is_match(name) {
            InterfaceKind::Wifi
        } else if self.cellular.is_match(name) {
            InterfaceKind::Cellular
        } else if self.vpn.is_match(name) {
            InterfaceKind::Vpn
        } else if self.ethernet.is_match(name) {
            InterfaceKind::Ethernet
        } else {
            InterfaceKind::Other
        };
        Some(kind)
    }

    /// Reduce a list of interface names to a connectivity report. An empty
    /// result is reported as `{none}`.
    pub fn report<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> BTreeSet<InterfaceKind> {
        let kinds: BTreeSet<InterfaceKind> =
            names.into_iter().filter_map(|n| self.classify(n)).collect();
        if kinds.is_empty() {
            BTreeSet::from([InterfaceKind::None])
        } else {
            kinds
        }
    }
}

/// Connectivity source backed by the host's interface list.
#[derive(Clone)]
pub struct SystemConnectivity {
    classifier: Arc<InterfaceClassifier>,
}

impl SystemConnectivity {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            classifier: Arc::new(InterfaceClassifier::new()?),
        })
    }
}

#[async_trait]
impl ConnectivitySource for SystemConnectivity {
    async fn check_connectivity(&self) -> anyhow::Result<BTreeSet<InterfaceKind>> {
        let classifier = self.classifier.clone();
        let kinds = tokio::task::spawn_blocking(move || {
            let networks = Networks::new_with_refreshed_list();
            let names: Vec<&str> = networks.list().keys().map(String::as_str).collect();
            debug!("Interfaces: {:?}", names);
            classifier.report(names)
        })
        .await?;
        Ok(kinds)
    }
}

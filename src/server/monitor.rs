use crate::bus::EventBus;
use crate::config::{Config, NetworkConfig};
use crate::error::{Error, Result};
use crate::event::{Event, EventClock, EventKind, Value};
use crate::http::HttpClient;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Outcome of one check round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkReport {
    /// Public address seen this round, if the lookup worked
    pub public_ip: Option<Ipv4Addr>,
    /// Reachability reported by the server checker, if one is configured
    pub reachable: Option<bool>,
    /// Warnings published this round; conditions already reported and
    /// unchanged since are not repeated
    pub warnings: Vec<Event>,
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    server: CheckedServer,
}

#[derive(Debug, Deserialize)]
struct CheckedServer {
    online: bool,
}

/// Periodic public IP and reachability checker.
///
/// Runs independently of the server's lifecycle state. Problems are published
/// as `network_warning` events when they appear or change, not on every round;
/// the checker never touches the process or the supervisor.
pub struct NetworkMonitor {
    config: NetworkConfig,
    http: Arc<dyn HttpClient>,
    bus: EventBus,
    clock: EventClock,
    /// Address the server is expected on
    expected_ip: Option<Ipv4Addr>,
    /// Address seen in the previous round
    last_seen: Option<Ipv4Addr>,
    /// Encryption is enabled while running under a compatibility layer
    encryption_risk: bool,
    /// Check name to the payload of its last published warning
    active: HashMap<&'static str, String>,
}

impl NetworkMonitor {
    pub fn new(config: &Config, http: Arc<dyn HttpClient>, bus: EventBus) -> Self {
        Self {
            expected_ip: config.network.public_ip,
            config: config.network.clone(),
            http,
            bus,
            clock: EventClock::new(),
            last_seen: None,
            encryption_risk: config.server.compat.is_some() && !config.supervisor.disable_encryption,
            active: HashMap::new(),
        }
    }

    pub fn expected_ip(&self) -> Option<Ipv4Addr> {
        self.expected_ip
    }

    /// Run until `token` is cancelled, checking once per interval.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }

    #[tracing::instrument(skip_all, fields(interval_secs = self.config.check_interval_secs))]
    pub async fn run(mut self, token: CancellationToken) {
        tracing::info!("Network checker started");
        let mut interval = time::interval(self.config.check_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let report = tokio::select! {
                        _ = token.cancelled() => break,
                        report = self.check_once() => report,
                    };
                    tracing::debug!(
                        public_ip = ?report.public_ip,
                        reachable = ?report.reachable,
                        warnings = report.warnings.len(),
                        "Network check finished"
                    );
                }
            }
        }

        tracing::info!("Network checker stopped");
    }

    /// One round of checks. New or changed warnings are published and also
    /// returned.
    pub async fn check_once(&mut self) -> NetworkReport {
        let mut report = NetworkReport::default();

        let encryption = self.encryption_risk.then(|| {
            Event::new(EventKind::NetworkWarning)
                .with("check", "encryption")
                .with(
                    "message",
                    "Encryption is enabled under a compatibility layer; players may fail to connect",
                )
        });
        self.settle("encryption", encryption, &mut report);

        match self.lookup_public_ip().await {
            Ok(ip) => {
                self.settle("ip_lookup", None, &mut report);
                report.public_ip = Some(ip);

                let address_warning = self.compare_ip(ip);
                for check in ["public_ip", "ip_changed"] {
                    let warning = address_warning
                        .as_ref()
                        .filter(|w| w.get("check").and_then(Value::as_str) == Some(check))
                        .cloned();
                    self.settle(check, warning, &mut report);
                }
                self.last_seen = Some(ip);

                if let Some(check_url) = self.config.server_check_url.clone() {
                    match self.check_reachable(&check_url, ip).await {
                        Ok(online) => {
                            report.reachable = Some(online);
                            let warning = (!online).then(|| {
                                Event::new(EventKind::NetworkWarning)
                                    .with("check", "reachability")
                                    .with("address", format!("{}:{}", ip, self.config.port))
                                    .with(
                                        "message",
                                        format!(
                                            "Server is not reachable from the internet at {}:{}",
                                            ip, self.config.port
                                        ),
                                    )
                            });
                            self.settle("reachability", warning, &mut report);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Reachability check failed");
                        }
                    }
                }
            }
            Err(e) => {
                let warning = Event::new(EventKind::NetworkWarning)
                    .with("check", "ip_lookup")
                    .with("message", format!("Could not determine public IP: {}", e));
                self.settle("ip_lookup", Some(warning), &mut report);
            }
        }

        for warning in &report.warnings {
            let event = self.clock.stamp(warning.clone());
            tracing::warn!(payload = ?event.payload, skip_notify = true, "Network warning");
            self.bus.publish(event);
        }

        report
    }

    /// Record the outcome of one evaluated check. A warning is queued for
    /// publishing only if it differs from the one already active for `check`,
    /// ignoring the free-text message.
    fn settle(&mut self, check: &'static str, warning: Option<Event>, report: &mut NetworkReport) {
        match warning {
            Some(warning) => {
                let mut key = warning.payload.clone();
                key.remove("message");
                let fingerprint = format!("{:?}", key);
                if self.active.get(check) != Some(&fingerprint) {
                    self.active.insert(check, fingerprint);
                    report.warnings.push(warning);
                }
            }
            None => {
                if self.active.remove(check).is_some() {
                    tracing::info!(check, "Network check passing again");
                }
            }
        }
    }

    fn compare_ip(&mut self, ip: Ipv4Addr) -> Option<Event> {
        match self.expected_ip {
            None => {
                tracing::info!(public_ip = %ip, "Using detected public IP");
                self.expected_ip = Some(ip);
                None
            }
            Some(expected) if expected != ip && self.config.overwrite_public_ip => {
                tracing::info!(old = %expected, new = %ip, "Public IP changed, adopting new address");
                self.expected_ip = Some(ip);
                None
            }
            Some(expected) if expected != ip => Some(
                Event::new(EventKind::NetworkWarning)
                    .with("check", "public_ip")
                    .with("expected", expected.to_string())
                    .with("actual", ip.to_string())
                    .with(
                        "message",
                        format!("Public IP is {} but the server is configured for {}", ip, expected),
                    ),
            ),
            Some(_) => match self.last_seen {
                Some(previous) if previous != ip => Some(
                    Event::new(EventKind::NetworkWarning)
                        .with("check", "ip_changed")
                        .with("previous", previous.to_string())
                        .with("actual", ip.to_string())
                        .with("message", format!("Public IP changed from {} to {}", previous, ip)),
                ),
                _ => None,
            },
        }
    }

    async fn lookup_public_ip(&self) -> Result<Ipv4Addr> {
        let body = self.http.get(self.config.ip_lookup_url.as_str()).await?;
        body.trim()
            .parse()
            .map_err(|_| Error::Http(format!("IP lookup returned '{}'", body.trim())))
    }

    async fn check_reachable(&self, base: &Url, ip: Ipv4Addr) -> Result<bool> {
        let mut url = base.clone();
        url.query_pairs_mut()
            .append_pair("url", &format!("{}:{}", ip, self.config.port));

        let body = self.http.get(url.as_str()).await?;
        let response: CheckResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Serialization(format!("Unexpected server check response: {}", e)))?;
        Ok(response.server.online)
    }
}

//! Service registry agent (Eureka-style REST).
//!
//! Registers the node on startup, heartbeats on a fixed period, and
//! deregisters on graceful shutdown. Registry failures are transient:
//! logged and retried on the next tick, never fatal to the node.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use litevec_core::config::REGISTRY_HEARTBEAT_SECS;

pub struct RegistryAgent {
    http: reqwest::Client,
    base: String,
    app: String,
    host: String,
    port: u16,
}

impl RegistryAgent {
    /// `base` is the registry root (e.g. `http://127.0.0.1:8761/eureka`);
    /// `addr` the node's `host:port` identity.
    pub fn new(http: reqwest::Client, base: &str, app: &str, addr: &str) -> Self {
        let (host, port) = match addr.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p.parse().unwrap_or(80)),
            None => (addr.to_string(), 80),
        };
        Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            app: app.to_uppercase(),
            host,
            port,
        }
    }

    fn instance_id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub async fn register(&self) -> Result<(), String> {
        let url = format!("{}/apps/{}", self.base, self.app);
        let body = serde_json::json!({
            "instance": {
                "instanceId": self.instance_id(),
                "hostName": self.host,
                "app": self.app,
                "ipAddr": self.host,
                "status": "UP",
                "port": { "$": self.port, "@enabled": "true" },
                "healthCheckUrl": format!("http://{}:{}/health", self.host, self.port),
                "statusPageUrl": format!("http://{}:{}/status", self.host, self.port),
                "dataCenterInfo": {
                    "@class": "com.netflix.appinfo.InstanceInfo$DefaultDataCenterInfo",
                    "name": "MyOwn"
                }
            }
        });
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if resp.status().is_success() {
            tracing::info!(app = %self.app, instance = %self.instance_id(), "registered with registry");
            Ok(())
        } else {
            Err(format!("registry returned {}", resp.status()))
        }
    }

    pub async fn heartbeat(&self) -> Result<(), String> {
        let url = format!("{}/apps/{}/{}", self.base, self.app, self.instance_id());
        let resp = self
            .http
            .put(&url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        // 404 means the registry lost us (e.g. it restarted); re-register.
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return self.register().await;
        }
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("registry returned {}", resp.status()))
        }
    }

    pub async fn deregister(&self) {
        let url = format!("{}/apps/{}/{}", self.base, self.app, self.instance_id());
        match self.http.delete(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(instance = %self.instance_id(), "deregistered from registry");
            }
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "registry deregistration rejected");
            }
            Err(e) => tracing::warn!(error = %e, "registry deregistration failed"),
        }
    }

    /// Registers (retrying until it sticks), then heartbeats until
    /// cancelled, deregistering on the way out.
    pub fn spawn(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            while let Err(e) = self.register().await {
                tracing::warn!(error = %e, "registry registration failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                }
            }
            let mut tick =
                tokio::time::interval(Duration::from_secs(REGISTRY_HEARTBEAT_SECS));
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.deregister().await;
                        return;
                    }
                    _ = tick.tick() => {
                        if let Err(e) = self.heartbeat().await {
                            tracing::warn!(error = %e, "registry heartbeat failed");
                        }
                    }
                }
            }
        });
    }
}

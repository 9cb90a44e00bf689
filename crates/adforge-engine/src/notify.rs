//! Fire-and-forget notifications.
//!
//! Transports are collaborators; the shipped default posts to a webhook
//! (Slack/Discord payload shape). Sends happen on detached tasks and
//! failures are swallowed — a notifier must never block or fail the
//! pipeline.

use adforge_core::config::NotifyConfig;

/// Notification sink. All methods are fire-and-forget; default impls are
/// no-ops so a sink can implement only what it cares about.
pub trait Notifier: Send + Sync {
    /// Every `n`-th successful ad, as configured.
    fn on_milestone(&self, _success_count: u64) {}

    /// A row failed terminally.
    fn on_failure(&self, _idx: usize, _error: &str) {}

    /// The run finished (or was shut down).
    fn on_completion(&self, _total: u64, _success: u64, _elapsed_secs: f64) {}
}

/// Silent sink used when notifications are disabled.
pub struct NullNotifier;

impl Notifier for NullNotifier {}

/// Webhook sink posting a Slack/Discord-compatible JSON body.
pub struct WebhookNotifier {
    http: reqwest::Client,
    cfg: NotifyConfig,
}

impl WebhookNotifier {
    /// Build a sink for the configured webhook.
    pub fn new(cfg: NotifyConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self { http, cfg })
    }

    fn send(&self, title: &str, message: &str) {
        if !self.cfg.enabled || self.cfg.webhook_url.is_empty() {
            return;
        }
        let http = self.http.clone();
        let url = self.cfg.webhook_url.clone();
        let payload = serde_json::json!({
            "text": format!("*{title}*\n{message}"),
            "content": format!("**{title}**\n{message}"),
        });
        tokio::spawn(async move {
            if let Err(err) = http.post(&url).json(&payload).send().await {
                tracing::debug!("webhook send failed: {err:#}");
            }
        });
    }
}

impl Notifier for WebhookNotifier {
    fn on_milestone(&self, success_count: u64) {
        if !self.cfg.on_milestone || self.cfg.milestone_every == 0 {
            return;
        }
        if success_count % self.cfg.milestone_every == 0 {
            self.send("Milestone", &format!("{success_count} ads generated"));
        }
    }

    fn on_failure(&self, idx: usize, error: &str) {
        if !self.cfg.on_failure {
            return;
        }
        let error: String = error.chars().take(200).collect();
        self.send("Row failed", &format!("index: {idx}\nerror: {error}"));
    }

    fn on_completion(&self, total: u64, success: u64, elapsed_secs: f64) {
        if !self.cfg.on_completion {
            return;
        }
        self.send(
            "Pipeline complete",
            &format!(
                "total: {total}\nsuccess: {success}\nfailed: {}\ntime: {elapsed_secs:.1}s",
                total - success.min(total)
            ),
        );
    }
}

use std::sync::Arc;
use std::time::Duration;

use nicolive::testing::{FakeApi, FakeConnector, FakeMediaServer};
use nicolive::{AuthContext, LiveId, SessionConfig};

use crate::AppState;
use crate::config::AccountSource;
use crate::metrics::RelayMetrics;
use crate::registry::SessionRegistry;

/// A fake media server plus the API and connector that point at it.
pub struct Upstream {
    pub server: FakeMediaServer,
    pub api: Arc<FakeApi>,
    pub connector: Arc<FakeConnector>,
    pub metrics: Arc<RelayMetrics>,
}

impl Upstream {
    pub async fn start() -> Self {
        let server = FakeMediaServer::start().await.expect("fake media server");
        let api = Arc::new(FakeApi::new(&server));
        let connector = Arc::new(FakeConnector::new(api.clone()));
        Self {
            server,
            api,
            connector,
            metrics: Arc::new(RelayMetrics::new()),
        }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(
            self.connector.clone(),
            SessionConfig::default(),
            self.metrics.clone(),
        ))
    }

    pub fn auth(&self) -> AuthContext {
        AuthContext::credentials("viewer@example.com", "hunter2")
    }

    /// `AppState` wired to a fresh registry over this upstream.
    pub fn app_state(&self) -> AppState {
        AppState {
            registry: self.registry(),
            account: Arc::new(AccountSource::Credentials {
                mail: "viewer@example.com".to_string(),
                password: "hunter2".to_string(),
            }),
            metrics: self.metrics.clone(),
            subscriber_queue: 16,
        }
    }
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met within 5s");
}

/// Wait until `live_id` has exactly `count` subscribers.
pub async fn wait_for_subscribers(registry: &SessionRegistry, live_id: &LiveId, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.subscriber_count(live_id).await != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscriber count not reached within 5s");
}

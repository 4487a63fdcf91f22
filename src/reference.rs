//! Airframe and schedule lookup tables.
//!
//! The tables come from an external provider and are reloaded on a fixed
//! cadence by [`run_refresher`]. Readers take cheap `Arc` snapshots and
//! tolerate staleness; the one hard rule is that schedule enrichment is
//! suppressed entirely once the schedule table has gone too long without
//! a successful reload, so we never decorate live traffic with day-old
//! flight numbers.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::message::IcaoId;
use crate::tuning::{REFERENCE_REFRESH_INTERVAL, SCHEDULE_STALE_AFTER};

/// Registration-side identity of an airframe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Airframe {
    pub icao: IcaoId,
    pub registration: String,
    #[serde(default)]
    pub equipment_type: String,
}

/// Scheduled-flight identity for a callsign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub callsign: String,
    pub flight_number: String,
    pub origin: String,
    pub destination: String,
}

pub type AirframeMap = HashMap<IcaoId, Airframe>;
pub type ScheduleMap = HashMap<String, Schedule>;

/// Source of the lookup tables. The production provider is an HTTP
/// service; tests install tables directly.
#[async_trait]
pub trait ReferenceProvider: Send + Sync {
    async fn fetch_airframes(&self) -> Result<AirframeMap>;
    async fn fetch_schedules(&self) -> Result<ScheduleMap>;
}

struct ReferenceState {
    airframes: Arc<AirframeMap>,
    schedules: Arc<ScheduleMap>,
    schedules_updated: Option<DateTime<Utc>>,
}

/// Shared handle to the last-successful table snapshots.
#[derive(Clone)]
pub struct ReferenceTables {
    inner: Arc<RwLock<ReferenceState>>,
}

impl ReferenceTables {
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(RwLock::new(ReferenceState {
                airframes: Arc::new(HashMap::new()),
                schedules: Arc::new(HashMap::new()),
                schedules_updated: None,
            })),
        }
    }

    /// Current table snapshots. The schedule map comes back empty when the
    /// table has not refreshed recently; the airframe table has no such
    /// cutoff since registrations do not go stale on that timescale.
    pub async fn snapshots(&self, now: DateTime<Utc>) -> (Arc<AirframeMap>, Arc<ScheduleMap>) {
        let state = self.inner.read().await;
        let schedules = match state.schedules_updated {
            Some(updated)
                if now.signed_duration_since(updated).to_std().unwrap_or_default()
                    <= SCHEDULE_STALE_AFTER =>
            {
                Arc::clone(&state.schedules)
            }
            _ => Arc::new(HashMap::new()),
        };
        (Arc::clone(&state.airframes), schedules)
    }

    pub async fn install_airframes(&self, airframes: AirframeMap) {
        let mut state = self.inner.write().await;
        state.airframes = Arc::new(airframes);
    }

    pub async fn install_schedules(&self, schedules: ScheduleMap, now: DateTime<Utc>) {
        let mut state = self.inner.write().await;
        state.schedules = Arc::new(schedules);
        state.schedules_updated = Some(now);
    }
}

/// Reloads both tables every [`REFERENCE_REFRESH_INTERVAL`] until
/// cancelled. A failed fetch keeps the previous snapshot.
pub async fn run_refresher(
    tables: ReferenceTables,
    provider: Arc<dyn ReferenceProvider>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(REFERENCE_REFRESH_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                match provider.fetch_airframes().await {
                    Ok(airframes) => {
                        debug!("reference: {} airframes loaded", airframes.len());
                        tables.install_airframes(airframes).await;
                    }
                    Err(e) => warn!("reference: airframe reload failed: {e:#}"),
                }
                match provider.fetch_schedules().await {
                    Ok(schedules) => {
                        debug!("reference: {} schedules loaded", schedules.len());
                        tables.install_schedules(schedules, Utc::now()).await;
                    }
                    Err(e) => warn!("reference: schedule reload failed: {e:#}"),
                }
            }
        }
    }
    info!("reference refresher exiting");
}

/// Fetches JSON tables from the reference service.
pub struct HttpReferenceProvider {
    client: reqwest::Client,
    airframes_url: String,
    schedules_url: String,
}

impl HttpReferenceProvider {
    pub fn new(airframes_url: String, schedules_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            airframes_url,
            schedules_url,
        }
    }
}

#[async_trait]
impl ReferenceProvider for HttpReferenceProvider {
    async fn fetch_airframes(&self) -> Result<AirframeMap> {
        let airframes: Vec<Airframe> = self
            .client
            .get(&self.airframes_url)
            .send()
            .await
            .context("requesting airframe table")?
            .error_for_status()
            .context("airframe table request rejected")?
            .json()
            .await
            .context("parsing airframe table")?;

        Ok(airframes
            .into_iter()
            .map(|af| (af.icao.clone(), af))
            .collect())
    }

    async fn fetch_schedules(&self) -> Result<ScheduleMap> {
        let schedules: Vec<Schedule> = self
            .client
            .get(&self.schedules_url)
            .send()
            .await
            .context("requesting schedule table")?
            .error_for_status()
            .context("schedule table request rejected")?
            .json()
            .await
            .context("parsing schedule table")?;

        Ok(schedules
            .into_iter()
            .map(|s| (s.callsign.clone(), s))
            .collect())
    }
}

/// Provider used when no reference service is configured; both tables
/// stay empty and enrichment is a no-op.
pub struct NoopReferenceProvider;

#[async_trait]
impl ReferenceProvider for NoopReferenceProvider {
    async fn fetch_airframes(&self) -> Result<AirframeMap> {
        Ok(HashMap::new())
    }

    async fn fetch_schedules(&self) -> Result<ScheduleMap> {
        Ok(HashMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn airframe(icao: &str, reg: &str) -> Airframe {
        Airframe {
            icao: IcaoId::new(icao),
            registration: reg.to_string(),
            equipment_type: "B738".to_string(),
        }
    }

    fn schedule(callsign: &str) -> Schedule {
        Schedule {
            callsign: callsign.to_string(),
            flight_number: "UA123".to_string(),
            origin: "SFO".to_string(),
            destination: "ORD".to_string(),
        }
    }

    #[tokio::test]
    async fn fresh_schedules_are_served() {
        let tables = ReferenceTables::empty();
        let now = Utc::now();

        tables
            .install_schedules(
                HashMap::from([("UAL123".to_string(), schedule("UAL123"))]),
                now,
            )
            .await;

        let (_, schedules) = tables.snapshots(now + Duration::minutes(5)).await;
        assert!(schedules.contains_key("UAL123"));
    }

    #[tokio::test]
    async fn stale_schedules_are_suppressed() {
        let tables = ReferenceTables::empty();
        let now = Utc::now();

        tables
            .install_schedules(
                HashMap::from([("UAL123".to_string(), schedule("UAL123"))]),
                now,
            )
            .await;

        let (_, schedules) = tables.snapshots(now + Duration::minutes(21)).await;
        assert!(schedules.is_empty());
    }

    #[tokio::test]
    async fn schedules_never_installed_stay_suppressed() {
        let tables = ReferenceTables::empty();
        let (_, schedules) = tables.snapshots(Utc::now()).await;
        assert!(schedules.is_empty());
    }

    #[tokio::test]
    async fn airframes_have_no_staleness_cutoff() {
        let tables = ReferenceTables::empty();
        let now = Utc::now();

        tables
            .install_airframes(HashMap::from([(IcaoId::new("AABBCC"), airframe("AABBCC", "N12345"))]))
            .await;

        let (airframes, _) = tables.snapshots(now + Duration::hours(6)).await;
        assert_eq!(
            airframes.get(&IcaoId::new("AABBCC")).unwrap().registration,
            "N12345"
        );
    }
}

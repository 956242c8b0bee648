//! Sitter presence: position reports and nearby search

use std::cmp::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use super::{latest_timestamp, record_items, rows, ServiceContext};
use crate::error::{Error, Result, StorageError};
use crate::models::{Collection, Coordinates, Origin, Record, SitterLocation};
use crate::sync::{BatchReport, Outcome, SubscriptionHandle};
use crate::transport::{EventTransport, TransportSubscription};
use crate::util::key_text;

const COLLECTION: Collection = Collection::SitterLocations;

/// Push channel carrying sitter location records or nearby-sitter rows
pub const LOCATIONS_CHANNEL: &str = "sitter_locations";

/// A sitter counts as active when their location changed this recently
pub const PRESENCE_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct NearbySitter {
    pub sitter_id: String,
    pub location: SitterLocation,
    pub distance_km: f64,
    pub updated_at: i64,
}

#[derive(Debug)]
pub struct LocationService {
    ctx: ServiceContext,
    // Last version of our own location the server accepted.
    confirmed: Mutex<Option<Record>>,
}

impl LocationService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self {
            ctx,
            confirmed: Mutex::new(None),
        }
    }

    /// Called for every accepted sitter location write, including our own
    /// optimistic ones and reverts.
    pub fn subscribe(&self, callback: impl Fn(&Record) + Send + Sync + 'static) -> SubscriptionHandle {
        self.ctx.engine.subscribe(COLLECTION, |_| true, callback)
    }

    /// Write our position optimistically, then report it to the server.
    ///
    /// On failure the optimistic record stands and the error is returned;
    /// [`revert_position`](Self::revert_position) undoes it.
    pub async fn report_position(&self, coords: Coordinates, online: bool) -> Result<()> {
        if !coords.is_valid() {
            return Err(Error::InvalidInput(format!(
                "coordinates out of range: {}, {}",
                coords.latitude, coords.longitude
            )));
        }
        self.remember_confirmed_baseline()?;

        let current = self.own_location()?;
        let location = SitterLocation {
            latitude: coords.latitude,
            longitude: coords.longitude,
            address: current.as_ref().and_then(|location| location.address.clone()),
            online,
            name: current.and_then(|location| location.name),
        };
        let record = self.write_own(&location)?;

        self.ctx
            .client
            .post(
                "/api/location/update",
                &json!({
                    "latitude": coords.latitude,
                    "longitude": coords.longitude,
                    "address": location.address,
                    "is_online": online,
                }),
            )
            .await?;
        self.set_confirmed(record)?;
        Ok(())
    }

    /// Toggle our online flag locally and on the server.
    pub async fn set_online(&self, online: bool) -> Result<()> {
        self.remember_confirmed_baseline()?;
        let updated = match self.own_location()? {
            Some(location) if location.online != online => {
                Some(self.write_own(&SitterLocation { online, ..location })?)
            }
            _ => None,
        };

        self.ctx
            .client
            .post("/api/location/status", &json!({"is_online": online}))
            .await?;
        if let Some(record) = updated {
            self.set_confirmed(record)?;
        }
        Ok(())
    }

    /// Restore the last server-confirmed position with a fresh timestamp.
    /// Without one, the optimistic position is kept but marked offline so it
    /// drops out of nearby results.
    ///
    /// Returns `false` when there was nothing to revert.
    pub fn revert_position(&self) -> Result<bool> {
        let Some(current) = self.own_record()? else {
            return Ok(false);
        };
        let confirmed = self.confirmed.lock().map_err(|_| StorageError::Poisoned)?.clone();

        let payload = match confirmed {
            Some(confirmed) if confirmed.same_content(&current) => return Ok(false),
            Some(confirmed) => confirmed.payload,
            None => {
                let mut location: SitterLocation = current
                    .decode()
                    .map_err(StorageError::from)?;
                if !location.online {
                    return Ok(false);
                }
                location.online = false;
                serde_json::to_value(location).map_err(StorageError::from)?
            }
        };
        let record = Record::local(current.id, current.owner_scope, payload, self.ctx.now());
        let outcome = self.ctx.engine.reconcile(COLLECTION, record)?;
        tracing::info!(%outcome, "Reverted own location");
        Ok(outcome.is_accepted())
    }

    /// Online sitters within `radius_km` of `center`, nearest first, ties by
    /// sitter id. Reads only the local store.
    pub fn nearby(&self, center: Coordinates, radius_km: f64) -> Result<Vec<NearbySitter>> {
        if !center.is_valid() {
            return Err(Error::InvalidInput("search center out of range".to_string()));
        }
        if !radius_km.is_finite() || radius_km < 0.0 {
            return Err(Error::InvalidInput(format!("invalid radius: {radius_km}")));
        }

        let mut found: Vec<NearbySitter> = self
            .ctx
            .engine
            .list(COLLECTION)?
            .into_iter()
            .filter_map(|record| {
                let location: SitterLocation = record.decode().ok()?;
                if !location.online || !location.coordinates().is_valid() {
                    return None;
                }
                let distance_km = center.distance_km(&location.coordinates());
                (distance_km <= radius_km).then(|| NearbySitter {
                    sitter_id: record.id,
                    location,
                    distance_km,
                    updated_at: record.updated_at,
                })
            })
            .collect();
        found.sort_by(|a, b| {
            a.distance_km
                .partial_cmp(&b.distance_km)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.sitter_id.cmp(&b.sitter_id))
        });
        Ok(found)
    }

    /// [`nearby`](Self::nearby), minus sitters not updated within `max_age`
    pub fn nearby_active(
        &self,
        center: Coordinates,
        radius_km: f64,
        max_age: Duration,
    ) -> Result<Vec<NearbySitter>> {
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = self.ctx.now().saturating_sub(max_age_ms);
        let mut found = self.nearby(center, radius_km)?;
        found.retain(|sitter| sitter.updated_at >= cutoff);
        Ok(found)
    }

    /// Fetch `GET /api/location/nearby-sitters` and merge the results.
    pub async fn refresh_nearby(&self, center: Coordinates, radius_km: f64) -> Result<BatchReport> {
        if !center.is_valid() {
            return Err(Error::InvalidInput("search center out of range".to_string()));
        }
        let query = [
            ("latitude", center.latitude.to_string()),
            ("longitude", center.longitude.to_string()),
            ("radius_km", radius_km.to_string()),
        ];
        let body = self.ctx.client.get("/api/location/nearby-sitters", &query).await?;
        let raws: Vec<Value> = rows(&body, "sitters").iter().map(sitter_record).collect();
        let report = self.ctx.engine.ingest_batch(COLLECTION, &raws)?;
        tracing::debug!(accepted = report.accepted(), total = report.total(), "Refreshed nearby sitters");
        Ok(report)
    }

    /// Route the sitter location channel into the engine. Keep the returned
    /// subscription to stay bound.
    pub fn bind(&self, transport: &EventTransport) -> TransportSubscription {
        let engine = Arc::clone(&self.ctx.engine);
        transport.subscribe(LOCATIONS_CHANNEL, move |event| {
            let raws: Vec<Value> = record_items(&event.data)
                .iter()
                .map(|item| {
                    if item.get("payload").is_some() {
                        item.clone()
                    } else {
                        sitter_record(item)
                    }
                })
                .collect();
            let report = engine.ingest_batch(COLLECTION, &raws)?;
            tracing::trace!(accepted = report.accepted(), total = report.total(), "Pushed sitter locations");
            Ok(())
        })
    }

    fn own_record(&self) -> Result<Option<Record>> {
        Ok(self
            .ctx
            .engine
            .get(COLLECTION, &self.ctx.user_id)?
            .filter(|record| !record.tombstone))
    }

    fn own_location(&self) -> Result<Option<SitterLocation>> {
        Ok(self
            .own_record()?
            .and_then(|record| record.decode::<SitterLocation>().ok()))
    }

    fn write_own(&self, location: &SitterLocation) -> Result<Record> {
        let user_id = self.ctx.user_id.clone();
        let record = Record::local(user_id.clone(), user_id, Value::Null, self.ctx.now())
            .with_payload(location)
            .map_err(StorageError::from)?;
        let outcome = self.ctx.engine.reconcile(COLLECTION, record.clone())?;
        if !matches!(outcome, Outcome::Inserted | Outcome::Updated) {
            tracing::debug!(%outcome, "Own location write not applied");
        }
        Ok(record)
    }

    /// A server-sourced record of our own position counts as confirmed until
    /// we have reported one ourselves.
    fn remember_confirmed_baseline(&self) -> Result<()> {
        let mut confirmed = self
            .confirmed
            .lock()
            .map_err(|_| StorageError::Poisoned)?;
        if confirmed.is_none() {
            *confirmed = self
                .own_record()?
                .filter(|record| record.origin == Origin::Remote);
        }
        Ok(())
    }

    fn set_confirmed(&self, record: Record) -> Result<()> {
        *self.confirmed.lock().map_err(|_| StorageError::Poisoned)? = Some(record);
        Ok(())
    }
}

/// Wire record for one `nearby-sitters` row
/// (`{userId, name, location: {latitude, longitude, address}, isOnline, lastSeen}`).
fn sitter_record(row: &Value) -> Value {
    let sitter_id = row
        .get("userId")
        .or_else(|| row.get("user_id"))
        .or_else(|| row.get("id"))
        .and_then(key_text);
    let location = row.get("location").unwrap_or(row);
    let updated_at = latest_timestamp(row, &["lastSeen", "updated_at"]);
    let name = row.get("name").and_then(Value::as_str);
    let address = location.get("address").and_then(Value::as_str);

    let payload = match (
        location.get("latitude").and_then(Value::as_f64),
        location.get("longitude").and_then(Value::as_f64),
    ) {
        (Some(latitude), Some(longitude)) => json!({
            "latitude": latitude,
            "longitude": longitude,
            "address": address,
            "online": row.get("isOnline").and_then(Value::as_bool).unwrap_or(true),
            "name": name,
        }),
        _ => Value::Null,
    };
    json!({
        "id": sitter_id,
        "owner_scope": sitter_id,
        "updated_at": updated_at,
        "payload": payload,
    })
}

#[cfg(test)]
mod tests {
    use std::panic::{catch_unwind, AssertUnwindSafe};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::SyncConfig;
    use crate::services::test_support::offline_context;
    use crate::sync::Diagnostics;
    use crate::transport::ChannelEvent;

    const CENTER: Coordinates = Coordinates::new(14.5995, 120.9842);

    // One degree of latitude is ~111.19 km on the haversine sphere.
    fn north_of_center(km: f64) -> Coordinates {
        Coordinates::new(CENTER.latitude + km / 111.194_93, CENTER.longitude)
    }

    fn seed(service: &LocationService, sitter: &str, at: Coordinates, online: bool, updated_at: i64) {
        let location = SitterLocation {
            latitude: at.latitude,
            longitude: at.longitude,
            address: None,
            online,
            name: Some(format!("Sitter {sitter}")),
        };
        let record = Record::remote(sitter, sitter, serde_json::to_value(location).unwrap(), updated_at);
        service.ctx.engine().reconcile(COLLECTION, record).unwrap();
    }

    #[test]
    fn nearby_returns_online_sitters_in_distance_order() {
        let service = LocationService::new(offline_context("1"));
        seed(&service, "s-far", north_of_center(3.0), true, 10);
        seed(&service, "s-mid", north_of_center(1.5), true, 10);
        seed(&service, "s-near", north_of_center(0.5), true, 10);
        seed(&service, "s-away", north_of_center(0.2), false, 10);

        let found = service.nearby(CENTER, 2.0).unwrap();
        let ids: Vec<&str> = found.iter().map(|sitter| sitter.sitter_id.as_str()).collect();
        assert_eq!(ids, vec!["s-near", "s-mid"]);
        assert!((found[0].distance_km - 0.5).abs() < 0.01);
    }

    #[test]
    fn equal_distances_break_ties_by_id() {
        let service = LocationService::new(offline_context("1"));
        seed(&service, "b", north_of_center(1.0), true, 10);
        seed(&service, "a", north_of_center(1.0), true, 10);

        let ids: Vec<String> = service
            .nearby(CENTER, 2.0)
            .unwrap()
            .into_iter()
            .map(|sitter| sitter.sitter_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn nearby_active_drops_stale_presence() {
        let service = LocationService::new(offline_context("1"));
        seed(&service, "old", north_of_center(0.5), true, 10);
        let now = service.ctx.now();
        seed(&service, "fresh", north_of_center(0.7), true, now);

        let ids: Vec<String> = service
            .nearby_active(CENTER, 2.0, Duration::from_millis(100))
            .unwrap()
            .into_iter()
            .map(|sitter| sitter.sitter_id)
            .collect();
        assert_eq!(ids, vec!["fresh"]);
    }

    #[test]
    fn invalid_search_input_is_rejected() {
        let service = LocationService::new(offline_context("1"));
        assert!(matches!(service.nearby(CENTER, -1.0), Err(Error::InvalidInput(_))));
        assert!(matches!(
            service.nearby(Coordinates::new(91.0, 0.0), 1.0),
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn failed_report_keeps_optimistic_position_until_reverted() {
        let service = LocationService::new(offline_context("s-1"));
        seed(&service, "s-1", north_of_center(5.0), true, 10);

        let error = service.report_position(north_of_center(0.3), true).await.unwrap_err();
        assert!(error.is_retryable());
        let found = service.nearby(CENTER, 1.0).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].sitter_id, "s-1");

        assert!(service.revert_position().unwrap());
        assert!(service.nearby(CENTER, 1.0).unwrap().is_empty());
        assert_eq!(service.nearby(CENTER, 10.0).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn revert_without_confirmed_position_goes_offline() {
        let service = LocationService::new(offline_context("s-1"));
        assert!(service.report_position(CENTER, true).await.is_err());
        assert_eq!(service.nearby(CENTER, 1.0).unwrap().len(), 1);

        assert!(service.revert_position().unwrap());
        assert!(service.nearby(CENTER, 1.0).unwrap().is_empty());
        assert!(!service.revert_position().unwrap());
    }

    #[test]
    fn nearby_rows_map_to_records() {
        let raw = sitter_record(&json!({
            "id": 4,
            "userId": 12,
            "name": "Ana",
            "location": {"latitude": 14.6, "longitude": 120.98, "address": "Makati"},
            "isOnline": true,
            "lastSeen": "2025-03-01T10:00:00Z",
            "distance": 0.4
        }));
        let record = Record::from_untrusted(&raw).unwrap();
        assert_eq!(record.id, "12");
        assert_eq!(record.updated_at, 1_740_823_200_000);
        let location: SitterLocation = record.decode().unwrap();
        assert_eq!(location.address.as_deref(), Some("Makati"));
        assert_eq!(location.name.as_deref(), Some("Ana"));
        assert!(location.online);
    }

    #[test]
    fn bound_channel_feeds_nearby_and_subscribers() {
        let service = LocationService::new(offline_context("1"));
        let transport = EventTransport::new(&SyncConfig::new("http://127.0.0.1:9"), Diagnostics::new(), None);
        let _binding = service.bind(&transport);

        let updates = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&updates);
        let _handle = service.subscribe(move |record| seen.lock().unwrap().push(record.id.clone()));

        let near = north_of_center(0.4);
        transport.deliver(ChannelEvent::new(
            LOCATIONS_CHANNEL,
            "record",
            json!([
                {"id": "s-2", "owner_scope": "s-2", "updated_at": 20, "payload": {
                    "latitude": near.latitude, "longitude": near.longitude, "online": true
                }},
                {
                    "userId": 31, "name": "Ana",
                    "location": {"latitude": CENTER.latitude, "longitude": CENTER.longitude},
                    "isOnline": true, "lastSeen": "2025-03-01T10:00:00Z"
                }
            ]),
        ));

        let ids: Vec<String> = service
            .nearby(CENTER, 1.0)
            .unwrap()
            .into_iter()
            .map(|sitter| sitter.sitter_id)
            .collect();
        assert_eq!(ids, vec!["31", "s-2"]);
        assert_eq!(*updates.lock().unwrap(), vec!["s-2", "31"]);
    }

    #[test]
    fn poisoned_confirmation_lock_is_a_storage_error() {
        let service = LocationService::new(offline_context("s-1"));
        seed(&service, "s-1", CENTER, true, 10);
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = service.confirmed.lock().unwrap();
            panic!("poison the lock");
        }));

        let record = Record::local("s-1", "s-1", json!({}), 10);
        assert!(matches!(
            service.set_confirmed(record),
            Err(Error::Storage(StorageError::Poisoned))
        ));
        assert!(matches!(
            service.revert_position(),
            Err(Error::Storage(StorageError::Poisoned))
        ));
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::{now_ms, AssignRequest, Engine, EngineError};
use crate::limits::*;
use crate::model::*;
use crate::notify::SlotUpdate;
use crate::observability::{op_label, REQUESTS_TOTAL, REQUEST_DURATION_SECONDS};
use crate::protocol::{self, Notification, ProtocolError, Request, Response};
use crate::tenant::TenantManager;

const DEFAULT_TENANT: &str = "default";

/// Per-connection state: the selected tenant and its LISTEN subscriptions.
struct Session {
    tenants: Arc<TenantManager>,
    tenant: String,
    engine: Option<Arc<Engine>>,
    listeners: HashMap<Ulid, JoinHandle<()>>,
    updates_tx: mpsc::Sender<SlotUpdate>,
}

impl Session {
    fn engine(&mut self) -> Result<Arc<Engine>, ProtocolError> {
        if let Some(engine) = &self.engine {
            return Ok(engine.clone());
        }
        let engine = self
            .tenants
            .get_or_create(&self.tenant)
            .map_err(|e| ProtocolError::Tenant(e.to_string()))?;
        self.engine = Some(engine.clone());
        Ok(engine)
    }

    fn unlisten_all(&mut self) {
        for (_, task) in self.listeners.drain() {
            task.abort();
        }
    }

    /// Forward one facility's broadcast into the connection's update queue.
    fn listen(&mut self, engine: &Engine, facility_id: Ulid) -> Result<(), ProtocolError> {
        if self.listeners.contains_key(&facility_id) {
            return Ok(());
        }
        if self.listeners.len() >= MAX_LISTEN_CHANNELS {
            return Err(ProtocolError::TooManyChannels);
        }
        let mut rx = engine.notify.subscribe(facility_id);
        let tx = self.updates_tx.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(update) => {
                        if tx.send(update).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(facility = %facility_id, "listener lagged, {n} updates dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.listeners.insert(facility_id, task);
        Ok(())
    }

    async fn handle_line(&mut self, line: &str) -> Response {
        let req = match protocol::parse_request(line) {
            Ok(req) => req,
            Err(e) => {
                metrics::counter!(REQUESTS_TOTAL, "op" => "unknown", "status" => "error").increment(1);
                return Response::error(&e);
            }
        };
        let op = op_label(&req);
        let start = Instant::now();
        let result = self.execute(req).await;
        metrics::histogram!(REQUEST_DURATION_SECONDS, "op" => op).record(start.elapsed().as_secs_f64());
        match result {
            Ok(data) => {
                metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => "ok").increment(1);
                Response::ok(data)
            }
            Err(e) => {
                metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => "error").increment(1);
                debug!(op, "request failed: {e}");
                Response::error(&e)
            }
        }
    }

    async fn execute(&mut self, req: Request) -> Result<serde_json::Value, ProtocolError> {
        if let Request::Use { tenant } = req {
            let engine = self
                .tenants
                .get_or_create(&tenant)
                .map_err(|e| ProtocolError::Tenant(e.to_string()))?;
            // Facility ids are per tenant; old subscriptions no longer apply.
            self.unlisten_all();
            self.tenant = tenant;
            self.engine = Some(engine);
            return Ok(json!({ "tenant": self.tenant }));
        }

        let engine = self.engine()?;
        let data = match req {
            Request::Use { .. } => unreachable!("handled above"),

            Request::RegisterFacility {
                id,
                code,
                name,
                capacity,
            } => {
                let facility = engine
                    .register_facility(id.unwrap_or_else(Ulid::new), &code, name, capacity)
                    .await?;
                serde_json::to_value(facility)?
            }
            Request::SetFacilityOpen { facility_id, open } => {
                engine.set_facility_open(facility_id, open).await?;
                json!({ "facility_id": facility_id, "open": open })
            }
            Request::RegisterFloor {
                id,
                facility_id,
                number,
                vehicle_class,
                slot_count,
            } => {
                let class: VehicleClass = vehicle_class.parse()?;
                let floor = engine
                    .register_floor(id.unwrap_or_else(Ulid::new), facility_id, number, class, slot_count)
                    .await?;
                serde_json::to_value(floor)?
            }
            Request::SetFloorStatus { floor_id, status } => {
                engine.set_floor_status(floor_id, status).await?;
                json!({ "floor_id": floor_id, "status": status })
            }
            Request::RegisterVehicle {
                id,
                plate,
                vehicle_class,
            } => {
                let class: VehicleClass = vehicle_class.parse()?;
                let vehicle = engine
                    .register_vehicle(id.unwrap_or_else(Ulid::new), &plate, class)
                    .await?;
                serde_json::to_value(vehicle)?
            }
            Request::SetTariff {
                facility_id,
                vehicle_class,
                first_hour_rate,
                per_hour_rate,
            } => {
                let class: VehicleClass = vehicle_class.parse()?;
                let tariff = engine
                    .set_tariff(facility_id, class, first_hour_rate, per_hour_rate)
                    .await?;
                serde_json::to_value(tariff)?
            }

            Request::ClaimSlot { slot_id, from, to } => {
                let claimed = engine.claim_slot(slot_id, from, to).await?;
                json!({ "slot_id": slot_id, "claimed": claimed })
            }
            Request::ReleaseSlot { slot_id } => {
                let previous = engine.release_slot(slot_id).await?;
                json!({ "slot_id": slot_id, "previous": previous })
            }

            Request::Assign {
                facility_id,
                vehicle_id,
                user_id,
                vehicle_class,
                window_start,
                duration_hours,
            } => {
                let vehicle_class: VehicleClass = vehicle_class.parse()?;
                let assignment = engine
                    .assign(AssignRequest {
                        facility_id,
                        vehicle_id,
                        user_id,
                        vehicle_class,
                        window_start,
                        duration_hours,
                    })
                    .await?;
                serde_json::to_value(assignment)?
            }
            Request::Reserve {
                slot_id,
                vehicle_id,
                user_id,
                window_start,
                window_end,
                ttl_ms,
            } => {
                if window_start >= window_end {
                    return Err(EngineError::InvalidArgument("window end must be after start").into());
                }
                let reservation = engine
                    .create_reservation(
                        slot_id,
                        vehicle_id,
                        &user_id,
                        Span::new(window_start, window_end),
                        ttl_ms.unwrap_or(DEFAULT_RESERVATION_GRACE_MS),
                    )
                    .await?;
                serde_json::to_value(reservation)?
            }
            Request::FindConflict {
                slot_id,
                window_start,
                window_end,
            } => {
                let conflict = engine.find_conflict(slot_id, window_start, window_end).await?;
                serde_json::to_value(conflict)?
            }
            Request::ExpireReservation { reservation_id } => {
                if engine.expire_reservation(reservation_id).await? {
                    json!({ "reservation_id": reservation_id, "expired": true })
                } else {
                    // Only a booking's hold can still be active here: it
                    // expires with its booking once the grace period lapses.
                    let status = engine
                        .get_reservation(&reservation_id)
                        .await
                        .map(|r| r.status);
                    let reason = match status {
                        Some(ReservationStatus::Active) => "owned by booking",
                        _ => "not active",
                    };
                    json!({
                        "reservation_id": reservation_id,
                        "expired": false,
                        "reason": reason,
                        "booking_id": engine.booking_for_reservation(&reservation_id),
                    })
                }
            }
            Request::CancelReservation { reservation_id } => {
                serde_json::to_value(engine.cancel_reservation(reservation_id).await?)?
            }

            Request::ConfirmEntry {
                booking_id,
                entry_time,
            } => {
                let booking = engine
                    .confirm_entry(booking_id, entry_time.unwrap_or_else(now_ms))
                    .await?;
                serde_json::to_value(booking)?
            }
            Request::ConfirmExit {
                booking_id,
                exit_time,
            } => {
                let receipt = engine
                    .confirm_exit(booking_id, exit_time.unwrap_or_else(now_ms))
                    .await?;
                serde_json::to_value(receipt)?
            }
            Request::Cancel { booking_id } => {
                serde_json::to_value(engine.cancel_booking(booking_id).await?)?
            }

            Request::SlotStatus { facility_id } => {
                serde_json::to_value(engine.slot_status(facility_id).await?)?
            }
            Request::Occupancy { facility_id } => {
                let occupancy = engine.occupancy(facility_id).await?;
                json!({
                    "available": occupancy.available,
                    "reserved": occupancy.reserved,
                    "occupied": occupancy.occupied,
                    "maintenance": occupancy.maintenance,
                    "total": occupancy.total(),
                })
            }
            Request::GetBooking { booking_id } => {
                let booking = engine
                    .get_booking(&booking_id)
                    .ok_or(EngineError::NotFound(booking_id))?;
                serde_json::to_value(booking)?
            }
            Request::GetReservation { reservation_id } => {
                let reservation = engine
                    .get_reservation(&reservation_id)
                    .await
                    .ok_or(EngineError::NotFound(reservation_id))?;
                serde_json::to_value(reservation)?
            }
            Request::GetTransaction { transaction_id } => {
                let transaction = engine
                    .get_transaction(&transaction_id)
                    .ok_or(EngineError::NotFound(transaction_id))?;
                serde_json::to_value(transaction)?
            }
            Request::OpenTransactions { vehicle_id } => {
                serde_json::to_value(engine.open_transactions(&vehicle_id))?
            }
            Request::ReservationsForSlot { slot_id } => {
                serde_json::to_value(engine.reservations_for_slot(&slot_id).await?)?
            }
            Request::FlaggedTransactions => serde_json::to_value(engine.flagged_transactions())?,

            Request::Listen { facility_id } => {
                if engine.get_facility(&facility_id).is_none() {
                    return Err(EngineError::NotFound(facility_id).into());
                }
                self.listen(&engine, facility_id)?;
                json!({ "listening": facility_id })
            }
            Request::Unlisten { facility_id } => {
                match facility_id {
                    Some(id) => {
                        if let Some(task) = self.listeners.remove(&id) {
                            task.abort();
                        }
                        engine.notify.prune(&id);
                    }
                    None => self.unlisten_all(),
                }
                json!({ "listening": self.listeners.keys().collect::<Vec<_>>() })
            }
        };
        Ok(data)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.unlisten_all();
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenants: Arc<TenantManager>,
) -> Result<(), LinesCodecError> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (updates_tx, mut updates_rx) = mpsc::channel::<SlotUpdate>(256);
    let mut session = Session {
        tenants,
        tenant: DEFAULT_TENANT.to_string(),
        engine: None,
        listeners: HashMap::new(),
        updates_tx,
    };

    loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        let resp = Response::error(&ProtocolError::LineTooLong);
                        framed.send(protocol::encode(&resp)).await?;
                        continue;
                    }
                    Some(Err(e)) => return Err(e),
                    None => break,
                };
                if line.trim().is_empty() {
                    continue;
                }
                let resp = session.handle_line(&line).await;
                framed.send(protocol::encode(&resp)).await?;
            }
            Some(update) = updates_rx.recv() => {
                framed.send(protocol::encode(&Notification::slot(&update))).await?;
            }
        }
    }
    Ok(())
}

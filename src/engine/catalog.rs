use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// Facility → floor hierarchy plus tariffs. Slots live in the `SlotStore`.
#[derive(Default)]
pub(super) struct Catalog {
    pub(super) facilities: DashMap<Ulid, Facility>,
    pub(super) floors: DashMap<Ulid, Floor>,
    /// Facility → (floor number, floor id), ascending by number.
    facility_floors: DashMap<Ulid, Vec<(u32, Ulid)>>,
    /// Facility code → facility id.
    codes: DashMap<String, Ulid>,
    pub(super) tariffs: DashMap<(Ulid, VehicleClass), Tariff>,
}

impl Catalog {
    pub(super) fn insert_facility(&self, facility: Facility) {
        self.codes.insert(facility.code.clone(), facility.id);
        self.facilities.insert(facility.id, facility);
    }

    pub(super) fn insert_floor(&self, floor: Floor) {
        let mut floors = self.facility_floors.entry(floor.facility_id).or_default();
        let pos = floors
            .binary_search_by_key(&floor.number, |(n, _)| *n)
            .unwrap_or_else(|e| e);
        floors.insert(pos, (floor.number, floor.id));
        drop(floors);
        self.floors.insert(floor.id, floor);
    }

    /// Floors of a facility in ascending floor-number order.
    pub(super) fn floors_of(&self, facility_id: &Ulid) -> Vec<Floor> {
        let ids: Vec<Ulid> = self
            .facility_floors
            .get(facility_id)
            .map(|e| e.value().iter().map(|(_, id)| *id).collect())
            .unwrap_or_default();
        ids.iter()
            .filter_map(|id| self.floors.get(id).map(|f| f.value().clone()))
            .collect()
    }

    pub(super) fn facility(&self, id: &Ulid) -> Option<Facility> {
        self.facilities.get(id).map(|f| f.value().clone())
    }

    pub(super) fn tariff(&self, facility_id: Ulid, vehicle_class: VehicleClass) -> Option<Tariff> {
        self.tariffs.get(&(facility_id, vehicle_class)).map(|t| *t.value())
    }
}

fn normalize_code(code: &str) -> Result<String, EngineError> {
    let code = code.trim().to_uppercase();
    if code.is_empty() {
        return Err(EngineError::InvalidArgument("facility code is empty"));
    }
    if code.len() > MAX_CODE_LEN {
        return Err(EngineError::LimitExceeded("facility code too long"));
    }
    if !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(EngineError::InvalidArgument("facility code must be alphanumeric"));
    }
    Ok(code)
}

fn normalize_plate(plate: &str) -> Result<String, EngineError> {
    let plate: String = plate
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase();
    if plate.is_empty() {
        return Err(EngineError::InvalidArgument("plate is empty"));
    }
    if plate.len() > MAX_PLATE_LEN {
        return Err(EngineError::LimitExceeded("plate too long"));
    }
    Ok(plate)
}

/// `{FACILITY}-{floor:02}-{n:04}`: lexicographic order equals slot index order.
pub(super) fn slot_code(facility_code: &str, floor_number: u32, index: u32) -> String {
    format!("{facility_code}-{floor_number:02}-{index:04}")
}

impl Engine {
    pub async fn register_facility(
        &self,
        id: Ulid,
        code: &str,
        name: Option<String>,
        capacity: u32,
    ) -> Result<Facility, EngineError> {
        let code = normalize_code(code)?;
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("facility name too long"));
        }
        let _gate = self.write_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        if self.catalog.facilities.len() >= MAX_FACILITIES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many facilities"));
        }
        if self.catalog.facilities.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if let Some(existing) = self.catalog.codes.get(&code) {
            return Err(EngineError::AlreadyExists(*existing.value()));
        }

        let event = Event::FacilityRegistered {
            id,
            code,
            name,
            capacity,
        };
        self.persist_unlocked(&event).await?;
        self.catalog.facility(&id).ok_or(EngineError::NotFound(id))
    }

    pub async fn set_facility_open(&self, id: Ulid, open: bool) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        if !self.catalog.facilities.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_unlocked(&Event::FacilityOpenChanged { id, open }).await
    }

    /// Registers a floor and generates its `slot_count` slots, all `available`.
    pub async fn register_floor(
        &self,
        id: Ulid,
        facility_id: Ulid,
        number: u32,
        vehicle_class: VehicleClass,
        slot_count: u32,
    ) -> Result<Floor, EngineError> {
        if slot_count == 0 {
            return Err(EngineError::InvalidArgument("floor needs at least one slot"));
        }
        if slot_count > MAX_SLOTS_PER_FLOOR {
            return Err(EngineError::LimitExceeded("too many slots on floor"));
        }
        let _gate = self.write_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        let facility = self
            .catalog
            .facility(&facility_id)
            .ok_or(EngineError::NotFound(facility_id))?;
        if self.catalog.floors.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let floors = self.catalog.floors_of(&facility_id);
        if floors.len() >= MAX_FLOORS_PER_FACILITY {
            return Err(EngineError::LimitExceeded("too many floors in facility"));
        }
        if let Some(existing) = floors.iter().find(|f| f.number == number) {
            return Err(EngineError::AlreadyExists(existing.id));
        }
        let used: u64 = floors.iter().map(|f| u64::from(f.slot_count)).sum();
        if used + u64::from(slot_count) > u64::from(facility.capacity) {
            return Err(EngineError::LimitExceeded("facility capacity exceeded"));
        }

        let slots = (1..=slot_count)
            .map(|i| (Ulid::new(), slot_code(&facility.code, number, i)))
            .collect();
        let event = Event::FloorRegistered {
            id,
            facility_id,
            number,
            vehicle_class,
            slots,
        };
        self.persist_unlocked(&event).await?;
        self.catalog
            .floors
            .get(&id)
            .map(|f| f.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    /// Only `active` floors take new allocations; existing bookings on a floor
    /// put into maintenance run to completion.
    pub async fn set_floor_status(&self, id: Ulid, status: FloorStatus) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        if !self.catalog.floors.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_unlocked(&Event::FloorStatusChanged { id, status }).await
    }

    pub async fn register_vehicle(
        &self,
        id: Ulid,
        plate: &str,
        vehicle_class: VehicleClass,
    ) -> Result<Vehicle, EngineError> {
        let plate = normalize_plate(plate)?;
        let _gate = self.write_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        if self.vehicles.len() >= MAX_VEHICLES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many vehicles"));
        }
        if self.vehicles.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let event = Event::VehicleRegistered {
            id,
            plate: plate.clone(),
            vehicle_class,
        };
        self.persist_unlocked(&event).await?;
        Ok(Vehicle {
            id,
            plate,
            class: vehicle_class,
        })
    }

    pub async fn set_tariff(
        &self,
        facility_id: Ulid,
        vehicle_class: VehicleClass,
        first_hour_rate: Money,
        per_hour_rate: Money,
    ) -> Result<Tariff, EngineError> {
        if first_hour_rate < 0 || per_hour_rate < 0 {
            return Err(EngineError::InvalidArgument("tariff rates must not be negative"));
        }
        if first_hour_rate > MAX_RATE || per_hour_rate > MAX_RATE {
            return Err(EngineError::LimitExceeded("tariff rate too large"));
        }
        let _gate = self.write_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        if !self.catalog.facilities.contains_key(&facility_id) {
            return Err(EngineError::NotFound(facility_id));
        }
        let tariff = Tariff {
            facility_id,
            vehicle_class,
            first_hour_rate,
            per_hour_rate,
        };
        self.persist_unlocked(&Event::TariffSet { tariff }).await?;
        Ok(tariff)
    }

    /// Active floors of an open facility carrying `vehicle_class`, ascending
    /// by floor number.
    pub(super) fn eligible_floors(
        &self,
        facility_id: Ulid,
        vehicle_class: VehicleClass,
    ) -> Result<Vec<Floor>, EngineError> {
        let facility = self
            .catalog
            .facility(&facility_id)
            .ok_or(EngineError::NotFound(facility_id))?;
        let floors: Vec<Floor> = if facility.open {
            self.catalog
                .floors_of(&facility_id)
                .into_iter()
                .filter(|f| f.vehicle_class == vehicle_class && f.status == FloorStatus::Active)
                .collect()
        } else {
            Vec::new()
        };
        if floors.is_empty() {
            return Err(EngineError::NoEligibleFloor {
                facility_id,
                vehicle_class,
            });
        }
        Ok(floors)
    }

    pub fn get_facility(&self, id: &Ulid) -> Option<Facility> {
        self.catalog.facility(id)
    }

    pub fn get_floor(&self, id: &Ulid) -> Option<Floor> {
        self.catalog.floors.get(id).map(|f| f.value().clone())
    }

    pub fn get_tariff(&self, facility_id: Ulid, vehicle_class: VehicleClass) -> Option<Tariff> {
        self.catalog.tariff(facility_id, vehicle_class)
    }
}

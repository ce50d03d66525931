use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

use super::conflict::{now_ms, validate_window};
use super::{Engine, EngineError, SharedBayState};

const TOP_N: usize = 5;

fn top_n(counts: HashMap<String, u64>) -> Vec<RankEntry> {
    let mut ranked: Vec<RankEntry> = counts
        .into_iter()
        .map(|(id, count)| RankEntry { id, count })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.id.cmp(&b.id)));
    ranked.truncate(TOP_N);
    ranked
}

impl Engine {
    fn bay_handles(&self) -> Vec<SharedBayState> {
        self.state.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn get_bay(&self, id: Ulid) -> Result<Bay, EngineError> {
        let rs = self.get_bay_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        Ok(guard.info())
    }

    /// All bays ordered by name, then key.
    pub async fn list_bays(&self) -> Vec<Bay> {
        let mut bays = Vec::with_capacity(self.state.len());
        for rs in self.bay_handles() {
            bays.push(rs.read().await.info());
        }
        bays.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.key.cmp(&b.key)));
        bays
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let bay_id = self.bay_for_booking(&id).ok_or(EngineError::NotFound(id))?;
        let rs = self.get_bay_state(&bay_id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        guard.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Every booking matching `filter`, newest created first.
    pub async fn list_bookings(&self, filter: &BookingFilter) -> Vec<Booking> {
        let handles = match filter.bay_id {
            Some(bay_id) => self.get_bay_state(&bay_id).into_iter().collect(),
            None => self.bay_handles(),
        };
        let mut out = Vec::new();
        for rs in handles {
            let guard = rs.read().await;
            out.extend(guard.bookings.iter().filter(|b| filter.matches(b)).cloned());
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.number.cmp(&a.number)));
        out
    }

    /// Active bookings on scheduled bays that intersect `[from, to)`, by start.
    ///
    /// An open-ended booking appears in every window at or after its start.
    pub async fn agenda(&self, from: Ms, to: Ms) -> Result<Vec<Booking>, EngineError> {
        validate_window(from, to)?;
        let mut out = Vec::new();
        for rs in self.bay_handles() {
            let guard = rs.read().await;
            if guard.is_waiting_list() {
                continue;
            }
            out.extend(
                guard
                    .active()
                    .filter(|b| b.span().touches_window(from, to))
                    .cloned(),
            );
        }
        out.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.number.cmp(&b.number)));
        Ok(out)
    }

    /// Per scheduled bay, the active booking holding it at `at` (default now).
    ///
    /// Should two active bookings both claim the instant, the one starting later wins.
    pub async fn occupancy(&self, at: Option<Ms>) -> Vec<BayOccupancy> {
        let at = at.unwrap_or_else(now_ms);
        let mut out = Vec::new();
        for rs in self.bay_handles() {
            let guard = rs.read().await;
            if guard.is_waiting_list() {
                continue;
            }
            let mut current = None;
            for b in guard.active() {
                if b.span().occupied_at(at) {
                    current = Some(b);
                }
            }
            out.push(BayOccupancy {
                bay: guard.info(),
                booking: current.cloned(),
            });
        }
        out.sort_by(|a, b| a.bay.name.cmp(&b.bay.name).then_with(|| a.bay.key.cmp(&b.bay.key)));
        out
    }

    /// Closed bookings whose end falls in `[from, to)`, most recently finished first.
    pub async fn ready(&self, from: Ms, to: Ms) -> Result<Vec<Booking>, EngineError> {
        validate_window(from, to)?;
        let mut out = Vec::new();
        for rs in self.bay_handles() {
            let guard = rs.read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.status == BookingStatus::Closed)
                    .filter(|b| b.end.is_some_and(|e| from <= e && e < to))
                    .cloned(),
            );
        }
        out.sort_by(|a, b| b.end.cmp(&a.end).then_with(|| b.number.cmp(&a.number)));
        Ok(out)
    }

    /// Active bookings parked on the waiting-list bay, newest first.
    /// With a range, only those starting in `[from, to)`.
    pub async fn waiting_list(&self, range: Option<(Ms, Ms)>) -> Result<Vec<Booking>, EngineError> {
        if let Some((from, to)) = range {
            validate_window(from, to)?;
        }
        let Some(rs) = self.waiting_list_bay().and_then(|id| self.get_bay_state(&id)) else {
            return Ok(Vec::new());
        };
        let guard = rs.read().await;
        let mut out: Vec<Booking> = guard
            .active()
            .filter(|b| range.is_none_or(|(from, to)| from <= b.start && b.start < to))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.number.cmp(&a.number)));
        Ok(out)
    }

    /// Dashboard counters. Rankings are over all bookings ever recorded.
    pub async fn summary(&self, from: Ms, to: Ms) -> Result<Summary, EngineError> {
        validate_window(from, to)?;
        let mut open = 0u64;
        let mut starting = 0u64;
        let mut bays = 0u64;
        let mut technicians: HashMap<String, u64> = HashMap::new();
        let mut vehicles: HashMap<String, u64> = HashMap::new();
        let mut companies: HashMap<String, u64> = HashMap::new();
        let mut per_bay: HashMap<String, u64> = HashMap::new();

        for rs in self.bay_handles() {
            let guard = rs.read().await;
            if !guard.is_waiting_list() {
                bays += 1;
            }
            for b in &guard.bookings {
                if b.is_active() {
                    open += 1;
                }
                if from <= b.start && b.start < to {
                    starting += 1;
                }
                for t in &b.technician_ids {
                    *technicians.entry(t.clone()).or_default() += 1;
                }
                *vehicles.entry(b.vehicle_id.clone()).or_default() += 1;
                if let Some(c) = &b.company_id {
                    *companies.entry(c.clone()).or_default() += 1;
                }
                *per_bay.entry(guard.id.to_string()).or_default() += 1;
            }
        }

        Ok(Summary {
            open,
            starting_in_range: starting,
            bays,
            top_technicians: top_n(technicians),
            top_vehicles: top_n(vehicles),
            top_companies: top_n(companies),
            top_bays: top_n(per_bay),
        })
    }
}

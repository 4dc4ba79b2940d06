//! Meal skip scheduling
//!
//! Students announce meals they will not eat so vendors can plan portions.
//! Date policy:
//! - a skip must be at least one day ahead (`skip_date >= tomorrow`)
//! - a skip can be cancelled only while its date is still in the future
//! - one skip per account, slot and date

use crate::{
    auth::authorize,
    error::{Error, Result},
    types::{AccountId, Principal, Role},
    Storage,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Meal slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MealSlot {
    /// Morning meal
    Breakfast,
    /// Midday meal
    Lunch,
    /// Evening meal
    Dinner,
}

impl MealSlot {
    /// All slots in serving order
    pub const ALL: [MealSlot; 3] = [MealSlot::Breakfast, MealSlot::Lunch, MealSlot::Dinner];

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            MealSlot::Breakfast => "BREAKFAST",
            MealSlot::Lunch => "LUNCH",
            MealSlot::Dinner => "DINNER",
        }
    }

    /// Parse from wire name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BREAKFAST" => Some(MealSlot::Breakfast),
            "LUNCH" => Some(MealSlot::Lunch),
            "DINNER" => Some(MealSlot::Dinner),
            _ => None,
        }
    }
}

impl fmt::Display for MealSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A scheduled meal skip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealSkip {
    /// Skip ID
    pub skip_id: Uuid,
    /// Student account
    pub account_id: AccountId,
    /// Skipped slot
    pub meal_slot: MealSlot,
    /// Skipped date
    pub skip_date: NaiveDate,
    /// Free text reason
    pub reason: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Body of a skip request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleSkipRequest {
    /// `BREAKFAST`, `LUNCH` or `DINNER`
    pub meal_slot: Option<String>,
    /// `YYYY-MM-DD`
    pub skip_date: Option<String>,
    /// Optional reason
    #[serde(default)]
    pub reason: String,
}

/// One skip in the vendor summary
#[derive(Debug, Clone, Serialize)]
pub struct SkipDetail {
    /// Skip ID
    pub skip_id: Uuid,
    /// Student account
    pub account_id: AccountId,
    /// Skipped slot
    pub meal_slot: MealSlot,
    /// Reason
    pub reason: String,
}

/// Skips expected for one date
#[derive(Debug, Clone, Serialize)]
pub struct UpcomingSkips {
    /// Date summarized
    pub date: NaiveDate,
    /// Count per slot, every slot present
    pub summary: BTreeMap<String, u32>,
    /// Individual skips
    pub skips: Vec<SkipDetail>,
}

/// Meal skip operations
#[derive(Debug, Clone)]
pub struct MealSkipScheduler {
    storage: Arc<Storage>,
}

impl MealSkipScheduler {
    /// Create scheduler over a store
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Record a skip for the principal. `today` is the caller's calendar date.
    pub async fn schedule(
        &self,
        principal: &Principal,
        request: ScheduleSkipRequest,
        today: NaiveDate,
    ) -> Result<MealSkip> {
        authorize(principal, &[Role::Student], Utc::now())?;

        let (slot, date) = match (request.meal_slot, request.skip_date) {
            (Some(slot), Some(date)) if !slot.is_empty() && !date.is_empty() => (slot, date),
            _ => {
                return Err(Error::Validation(
                    "Missing meal_slot or skip_date".to_string(),
                ))
            }
        };
        let meal_slot = MealSlot::parse(&slot)
            .ok_or_else(|| Error::Validation(format!("Invalid meal slot: {}", slot)))?;
        let skip_date = parse_date(&date, "Invalid date format. Use YYYY-MM-DD")?;

        if skip_date < today + Duration::days(1) {
            return Err(Error::Validation(
                "Skips must be scheduled at least 24 hours in advance".to_string(),
            ));
        }

        let skip = MealSkip {
            skip_id: Uuid::now_v7(),
            account_id: principal.account_id.clone(),
            meal_slot,
            skip_date,
            reason: request.reason,
            created_at: Utc::now(),
        };

        if !self.storage.insert_meal_skip(&skip).await? {
            return Err(Error::Validation(
                "Meal already skipped for this slot and date".to_string(),
            ));
        }

        tracing::info!(
            account_id = %skip.account_id,
            meal_slot = %skip.meal_slot,
            skip_date = %skip.skip_date,
            "Meal skip recorded"
        );
        Ok(skip)
    }

    /// The principal's skips by ascending date, optionally only from `today` on
    pub fn list(
        &self,
        principal: &Principal,
        upcoming: bool,
        today: NaiveDate,
    ) -> Result<Vec<MealSkip>> {
        authorize(principal, &[Role::Student], Utc::now())?;

        let mut skips = self.storage.meal_skips_for_account(&principal.account_id)?;
        if upcoming {
            skips.retain(|skip| skip.skip_date >= today);
        }
        skips.sort_by_key(|skip| (skip.skip_date, skip.meal_slot));
        Ok(skips)
    }

    /// Cancel one of the principal's skips
    pub async fn cancel(
        &self,
        principal: &Principal,
        skip_id: Uuid,
        today: NaiveDate,
    ) -> Result<()> {
        authorize(principal, &[Role::Student], Utc::now())?;

        let skip = self
            .storage
            .meal_skips_for_account(&principal.account_id)?
            .into_iter()
            .find(|skip| skip.skip_id == skip_id)
            .ok_or_else(|| Error::NotFound("Skip request not found".to_string()))?;

        if skip.skip_date <= today {
            return Err(Error::Validation(
                "Cannot cancel skips for today or past dates".to_string(),
            ));
        }

        self.storage.delete_meal_skip(&skip).await?;
        tracing::info!(account_id = %skip.account_id, skip_id = %skip.skip_id, "Meal skip cancelled");
        Ok(())
    }

    /// Skips for `date` (default tomorrow), optionally one slot only
    pub fn upcoming(
        &self,
        principal: &Principal,
        date: Option<&str>,
        meal_slot: Option<&str>,
        today: NaiveDate,
    ) -> Result<UpcomingSkips> {
        authorize(principal, &[Role::Vendor, Role::Admin], Utc::now())?;

        let date = match date {
            Some(date) => parse_date(date, "Invalid date format")?,
            None => today + Duration::days(1),
        };
        let slot_filter = match meal_slot {
            Some(slot) => Some(
                MealSlot::parse(slot)
                    .ok_or_else(|| Error::Validation(format!("Invalid meal slot: {}", slot)))?,
            ),
            None => None,
        };

        let mut summary: BTreeMap<String, u32> = MealSlot::ALL
            .iter()
            .map(|slot| (slot.as_str().to_string(), 0))
            .collect();
        let mut skips = Vec::new();

        for skip in self.storage.meal_skips_on(date)? {
            if slot_filter.is_some_and(|slot| slot != skip.meal_slot) {
                continue;
            }
            *summary.entry(skip.meal_slot.as_str().to_string()).or_default() += 1;
            skips.push(SkipDetail {
                skip_id: skip.skip_id,
                account_id: skip.account_id,
                meal_slot: skip.meal_slot,
                reason: skip.reason,
            });
        }

        Ok(UpcomingSkips {
            date,
            summary,
            skips,
        })
    }
}

fn parse_date(value: &str, message: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| Error::Validation(message.to_string()))
}

//! Randomized request parameters
//!
//! Pure generators: everything random is drawn from the caller's RNG, so a
//! seeded RNG reproduces the same traffic.

use chrono::NaiveDateTime;
use rand::Rng;
use serde::Serialize;

/// Characters used for generated ad titles
pub const TITLE_CHARSET: &[u8] = b"aeioubcdfghijpqrstuv";
/// Length of generated ad titles
pub const TITLE_LEN: usize = 16;

/// Country codes targeted by generated traffic
pub const COUNTRIES: [&str; 6] = ["US", "TW", "GB", "AU", "FR", "DE"];
/// Page sizes used by the query scenario
pub const LIMITS: [u32; 3] = [5, 10, 15];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub const ALL: [Gender; 2] = [Gender::Male, Gender::Female];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
    Web,
    Desktop,
    SmartTv,
}

impl Platform {
    pub const ALL: [Platform; 5] = [
        Platform::Android,
        Platform::Ios,
        Platform::Web,
        Platform::Desktop,
        Platform::SmartTv,
    ];
}

fn pick<T: Copy, R: Rng>(rng: &mut R, items: &[T]) -> T {
    items[rng.random_range(0..items.len())]
}

/// Body of `POST /ad`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewAd {
    pub title: String,
    pub country: &'static str,
    pub to_age: u32,
    pub from_age: u32,
    pub gender: Gender,
    pub platform: Platform,
    pub end_at: NaiveDateTime,
}

impl NewAd {
    /// Random ad with `from_age` in 1..=10 and an age span of 1..=95 years
    pub fn generate<R: Rng>(rng: &mut R, end_at: NaiveDateTime) -> Self {
        let title = (0..TITLE_LEN)
            .map(|_| pick(rng, TITLE_CHARSET) as char)
            .collect();
        let from_age = rng.random_range(1..=10);
        let to_age = from_age + rng.random_range(1..=95);

        Self {
            title,
            country: pick(rng, &COUNTRIES),
            to_age,
            from_age,
            gender: pick(rng, &Gender::ALL),
            platform: pick(rng, &Platform::ALL),
            end_at,
        }
    }
}

/// Filter shared by every page request of one query iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryParams {
    pub limit: u32,
    pub age: u32,
    pub gender: Gender,
    pub country: &'static str,
    pub platform: Platform,
}

impl QueryParams {
    pub fn generate<R: Rng>(rng: &mut R) -> Self {
        Self {
            limit: pick(rng, &LIMITS),
            age: rng.random_range(1..=100),
            gender: pick(rng, &Gender::ALL),
            country: pick(rng, &COUNTRIES),
            platform: pick(rng, &Platform::ALL),
        }
    }

    /// Query string for the page at `offset`
    pub fn page(&self, offset: u32) -> AdQuery {
        AdQuery {
            limit: self.limit,
            offset,
            age: self.age,
            gender: self.gender,
            country: self.country,
            platform: self.platform,
        }
    }
}

/// Query string of `GET /ad`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdQuery {
    pub limit: u32,
    pub offset: u32,
    pub age: u32,
    pub gender: Gender,
    pub country: &'static str,
    pub platform: Platform,
}

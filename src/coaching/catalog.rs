//! Package catalog.
//!
//! Packages are immutable, catalog-defined bundles of coaching access. Each
//! is identified by a sport and a tier and fixes the price, the number of
//! video clips the player may send, and how many days the access lasts.
//!
//! ```rust,ignore
//! use coachline::coaching::{PackageCatalog, Tier};
//!
//! let catalog = PackageCatalog::builder()
//!     .sport("golf")
//!         .tier(Tier::One, 4725, 3, 3)
//!         .tier(Tier::Two, 6075, 7, 5)
//!         .done()
//!     .build();
//!
//! let package = catalog.resolve("golf", Tier::Two)?;
//! assert_eq!(package.clip_allowance, 7);
//! ```

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{CoachingError, CoachingResult};

/// Package tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    #[serde(rename = "1")]
    One,
    #[serde(rename = "2")]
    Two,
    #[serde(rename = "3")]
    Three,
    #[serde(rename = "subscription")]
    Subscription,
}

impl Tier {
    /// Parse a tier from the forms found in checkout metadata.
    ///
    /// Accepts `"1"`, `"tier_1"`, `"tier1"`, `"subscription"` and so on.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        let normalized = normalized
            .strip_prefix("tier_")
            .or_else(|| normalized.strip_prefix("tier"))
            .unwrap_or(&normalized);

        match normalized {
            "1" | "one" => Some(Self::One),
            "2" | "two" => Some(Self::Two),
            "3" | "three" => Some(Self::Three),
            "subscription" | "sub" => Some(Self::Subscription),
            _ => None,
        }
    }

    /// Convert to string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::One => "1",
            Self::Two => "2",
            Self::Three => "3",
            Self::Subscription => "subscription",
        }
    }
}

impl FromStr for Tier {
    type Err = CoachingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| CoachingError::invalid("tier", format!("unknown tier '{}'", s)))
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A purchasable coaching package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    /// Sport, lowercase.
    pub sport: String,
    /// Tier within the sport.
    pub tier: Tier,
    /// Price in minor currency units.
    pub price: i64,
    /// Video clips included.
    pub clip_allowance: u32,
    /// Days of access from purchase.
    pub validity_days: u32,
}

/// The set of packages on sale.
#[derive(Debug, Clone, Default)]
pub struct PackageCatalog {
    packages: HashMap<(String, Tier), Package>,
}

impl PackageCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder for constructing a catalog.
    #[must_use]
    pub fn builder() -> PackageCatalogBuilder {
        PackageCatalogBuilder::new()
    }

    /// The packages the platform sells out of the box.
    #[must_use]
    pub fn standard() -> Self {
        Self::builder()
            .sport("golf")
                .tier(Tier::One, 4725, 3, 3)
                .tier(Tier::Two, 6075, 7, 5)
                .tier(Tier::Three, 10125, 15, 10)
                .tier(Tier::Subscription, 17500, 30, 30)
                .done()
            .sport("tennis")
                .tier(Tier::One, 4050, 3, 3)
                .tier(Tier::Two, 5400, 7, 5)
                .tier(Tier::Three, 8775, 15, 10)
                .tier(Tier::Subscription, 15000, 30, 30)
                .done()
            .sport("padel")
                .tier(Tier::One, 3375, 3, 3)
                .tier(Tier::Two, 4725, 7, 5)
                .tier(Tier::Three, 7425, 15, 10)
                .done()
            .build()
    }

    /// Add or replace a package.
    pub fn add(&mut self, package: Package) {
        self.packages
            .insert((package.sport.clone(), package.tier), package);
    }

    /// Look up a package. Unknown combinations are an error, never a default.
    pub fn resolve(&self, sport: &str, tier: Tier) -> CoachingResult<&Package> {
        self.get(sport, tier)
            .ok_or_else(|| CoachingError::PackageNotFound {
                sport: sport.to_string(),
                tier: tier.to_string(),
            })
    }

    /// Look up a package, returning `None` when absent.
    #[must_use]
    pub fn get(&self, sport: &str, tier: Tier) -> Option<&Package> {
        self.packages
            .get(&(sport.trim().to_ascii_lowercase(), tier))
    }

    /// Iterate over all packages.
    pub fn iter(&self) -> impl Iterator<Item = &Package> {
        self.packages.values()
    }

    /// Number of packages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    /// Check if the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

/// Builder for [`PackageCatalog`].
#[derive(Debug, Default)]
#[must_use = "builder does nothing until you call build()"]
pub struct PackageCatalogBuilder {
    catalog: PackageCatalog,
}

impl PackageCatalogBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start defining the packages for a sport.
    pub fn sport(self, sport: impl Into<String>) -> SportBuilder {
        SportBuilder {
            parent: self,
            sport: sport.into().trim().to_ascii_lowercase(),
        }
    }

    /// Build the catalog.
    #[must_use]
    pub fn build(self) -> PackageCatalog {
        self.catalog
    }
}

/// Builder for the packages of a single sport.
#[must_use = "call done() to return to the catalog builder"]
pub struct SportBuilder {
    parent: PackageCatalogBuilder,
    sport: String,
}

impl SportBuilder {
    /// Add a tier: price in minor units, clip allowance, validity in days.
    pub fn tier(mut self, tier: Tier, price: i64, clip_allowance: u32, validity_days: u32) -> Self {
        self.parent.catalog.add(Package {
            sport: self.sport.clone(),
            tier,
            price,
            clip_allowance,
            validity_days,
        });
        self
    }

    /// Finish this sport.
    pub fn done(self) -> PackageCatalogBuilder {
        self.parent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_golf_tier_two() {
        let catalog = PackageCatalog::standard();
        let package = catalog.resolve("golf", Tier::Two).unwrap();
        assert_eq!(package.price, 6075);
        assert_eq!(package.clip_allowance, 7);
        assert_eq!(package.validity_days, 5);
    }

    #[test]
    fn test_sport_lookup_is_case_insensitive() {
        let catalog = PackageCatalog::standard();
        assert!(catalog.get("Golf ", Tier::One).is_some());
    }

    #[test]
    fn test_unknown_package_is_error() {
        let catalog = PackageCatalog::standard();
        let err = catalog.resolve("curling", Tier::One).unwrap_err();
        assert!(matches!(err, CoachingError::PackageNotFound { .. }));

        let err = catalog.resolve("padel", Tier::Subscription).unwrap_err();
        assert_eq!(err.to_string(), "No package for sport 'padel' tier 'subscription'");
    }

    #[test]
    fn test_tier_parse() {
        assert_eq!(Tier::parse("2"), Some(Tier::Two));
        assert_eq!(Tier::parse("tier_3"), Some(Tier::Three));
        assert_eq!(Tier::parse("Tier1"), Some(Tier::One));
        assert_eq!(Tier::parse("subscription"), Some(Tier::Subscription));
        assert_eq!(Tier::parse("gold"), None);
        assert!("".parse::<Tier>().is_err());
    }

    #[test]
    fn test_builder() {
        let catalog = PackageCatalog::builder()
            .sport("Squash")
                .tier(Tier::One, 1000, 2, 1)
                .done()
            .build();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.resolve("squash", Tier::One).unwrap().price, 1000);
    }
}

//! Failure classification for upstream errors.
//!
//! Errors reach the breaker in many shapes: transport errors from `std::io`,
//! deadline errors from `tokio::time::timeout`, HTTP statuses wrapped in
//! [`ApiError`], or opaque boxed errors from a tower stack. [`classify_error`]
//! maps all of them onto one closed set of [`ErrorCategory`] values, and a
//! [`FailurePolicy`] decides which of those count toward opening a circuit.
//!
//! Anything that cannot be recognised is [`ErrorCategory::Unknown`] and always
//! counts.

use crate::error::ApiError;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt;

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ErrorCategory {
    /// The call exceeded its deadline.
    Timeout,
    /// The upstream refused the connection.
    ConnectionRefused,
    /// 5xx-class upstream failure.
    ServerError,
    /// 4xx-class caller mistake (bad request, unauthorized, not found).
    ClientError,
    /// Upstream quota signal (HTTP 429 and equivalents).
    RateLimited,
    /// Unrecognised error shape.
    Unknown,
}

impl ErrorCategory {
    /// Stable snake_case name, used in telemetry.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ConnectionRefused => "connection_refused",
            Self::ServerError => "server_error",
            Self::ClientError => "client_error",
            Self::RateLimited => "rate_limited",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category plus the HTTP status it was derived from, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Category of the error.
    pub category: ErrorCategory,
    /// HTTP status code, when the error carried one.
    pub status: Option<u16>,
}

impl Classification {
    /// The fail-safe classification.
    pub const UNKNOWN: Self = Self { category: ErrorCategory::Unknown, status: None };

    /// Classification without a status code.
    pub const fn of(category: ErrorCategory) -> Self {
        Self { category, status: None }
    }

    /// Classify an HTTP status code.
    pub fn from_status(status: u16) -> Self {
        let category = match status {
            408 => ErrorCategory::Timeout,
            429 => ErrorCategory::RateLimited,
            400..=499 => ErrorCategory::ClientError,
            500..=599 => ErrorCategory::ServerError,
            _ => ErrorCategory::Unknown,
        };
        Self { category, status: Some(status) }
    }
}

/// Types that know their own failure category.
pub trait Classify {
    fn classify(&self) -> Classification;
}

impl Classify for ApiError {
    fn classify(&self) -> Classification {
        match self {
            ApiError::Timeout(_) => Classification::of(ErrorCategory::Timeout),
            ApiError::ConnectionRefused(_) => Classification::of(ErrorCategory::ConnectionRefused),
            ApiError::Status { status, .. } => Classification::from_status(*status),
            ApiError::QuotaExceeded => Classification::of(ErrorCategory::RateLimited),
            ApiError::Other(_) => Classification::UNKNOWN,
        }
    }
}

impl Classify for std::io::Error {
    fn classify(&self) -> Classification {
        use std::io::ErrorKind;
        match self.kind() {
            ErrorKind::TimedOut => Classification::of(ErrorCategory::Timeout),
            ErrorKind::ConnectionRefused => Classification::of(ErrorCategory::ConnectionRefused),
            _ => match self.get_ref() {
                Some(inner) => classify_error(inner),
                None => Classification::UNKNOWN,
            },
        }
    }
}

impl Classify for tokio::time::error::Elapsed {
    fn classify(&self) -> Classification {
        Classification::of(ErrorCategory::Timeout)
    }
}

impl Classify for Box<dyn Error + Send + Sync> {
    fn classify(&self) -> Classification {
        classify_error(self.as_ref())
    }
}

/// Classify any error by walking its `source()` chain.
///
/// The first link that is a recognised type decides; an unrecognised chain is
/// [`Classification::UNKNOWN`].
pub fn classify_error(err: &(dyn Error + 'static)) -> Classification {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(api) = e.downcast_ref::<ApiError>() {
            return api.classify();
        }
        if e.is::<tokio::time::error::Elapsed>() {
            return Classification::of(ErrorCategory::Timeout);
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            let classification = io.classify();
            if classification.category != ErrorCategory::Unknown {
                return classification;
            }
        }
        current = e.source();
    }
    Classification::UNKNOWN
}

/// Decides which classified errors count toward a breaker's failure threshold.
///
/// A status code with an explicit rule decides on its own. Everything else is
/// judged by category, so an unlisted 4xx is still a client error and does
/// not count. Unknown errors always count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailurePolicy {
    ignored_statuses: BTreeSet<u16>,
    counted_statuses: BTreeSet<u16>,
    ignored_categories: BTreeSet<ErrorCategory>,
}

/// Status codes that do not trip a breaker by default.
pub const DEFAULT_IGNORED_STATUSES: [u16; 5] = [400, 401, 403, 404, 429];

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            ignored_statuses: DEFAULT_IGNORED_STATUSES.into_iter().collect(),
            counted_statuses: BTreeSet::new(),
            ignored_categories: [ErrorCategory::ClientError, ErrorCategory::RateLimited]
                .into_iter()
                .collect(),
        }
    }
}

impl FailurePolicy {
    /// Policy with the default ignore lists.
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy under which every error counts.
    pub fn count_all() -> Self {
        Self {
            ignored_statuses: BTreeSet::new(),
            counted_statuses: BTreeSet::new(),
            ignored_categories: BTreeSet::new(),
        }
    }

    /// Stop counting errors with this status.
    pub fn ignore_status(mut self, status: u16) -> Self {
        self.counted_statuses.remove(&status);
        self.ignored_statuses.insert(status);
        self
    }

    /// Count errors with this status, whatever their category.
    pub fn count_status(mut self, status: u16) -> Self {
        self.ignored_statuses.remove(&status);
        self.counted_statuses.insert(status);
        self
    }

    /// Stop counting errors of this category. Ignoring
    /// [`ErrorCategory::Unknown`] has no effect.
    pub fn ignore_category(mut self, category: ErrorCategory) -> Self {
        if category != ErrorCategory::Unknown {
            self.ignored_categories.insert(category);
        }
        self
    }

    /// Count errors of this category.
    pub fn count_category(mut self, category: ErrorCategory) -> Self {
        self.ignored_categories.remove(&category);
        self
    }

    /// Whether `classification` counts toward the failure threshold.
    pub fn counts(&self, classification: &Classification) -> bool {
        if let Some(status) = classification.status {
            if self.counted_statuses.contains(&status) {
                return true;
            }
            if self.ignored_statuses.contains(&status) {
                return false;
            }
        }
        !self.ignored_categories.contains(&classification.category)
    }

    /// Ignored status codes, ascending.
    pub fn ignored_statuses(&self) -> impl Iterator<Item = u16> + '_ {
        self.ignored_statuses.iter().copied()
    }

    /// Ignored categories.
    pub fn ignored_categories(&self) -> impl Iterator<Item = ErrorCategory> + '_ {
        self.ignored_categories.iter().copied()
    }
}

//! Maps an on-prem IP address to the service and datacenter it belongs to.
//!
//! Service lookup is layered: cache, static exception set, reverse DNS plus
//! hostname prefix table, then a sentinel. Datacenter lookup is a plain
//! prefix scan over the address text.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use dns_lookup::LookupErrorKind;
use tracing::debug;

use crate::config::ClassifierConfig;

/// Service for an address whose reverse lookup failed.
pub const UNKNOWN: &str = "unknown";
/// Service or datacenter for an address no configured prefix matches.
pub const OTHER: &str = "other";

/// Outcome of a reverse-DNS lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(String),
    /// No PTR record for the address.
    NotFound,
    /// Temporary resolver failure (EAI_AGAIN).
    Timeout,
    /// The input is not an IP address.
    Malformed,
    Failed(String),
}

pub trait ReverseResolver {
    fn reverse(&self, ip: &str) -> Resolution;
}

impl<R: ReverseResolver + ?Sized> ReverseResolver for &R {
    fn reverse(&self, ip: &str) -> Resolution {
        (**self).reverse(ip)
    }
}

/// Blocking lookup through the system resolver (getnameinfo with
/// `NI_NAMEREQD`, so an address without a PTR record is an error rather than
/// its numeric form).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl ReverseResolver for SystemResolver {
    fn reverse(&self, ip: &str) -> Resolution {
        let addr: IpAddr = match ip.parse() {
            Ok(addr) => addr,
            Err(_) => return Resolution::Malformed,
        };
        let sock = SocketAddr::new(addr, 0);
        match dns_lookup::getnameinfo(&sock, libc::NI_NAMEREQD) {
            Ok((host, _)) => Resolution::Resolved(host),
            Err(e) => resolution_for(e.kind()),
        }
    }
}

fn resolution_for(kind: LookupErrorKind) -> Resolution {
    match kind {
        LookupErrorKind::NoName | LookupErrorKind::NoData => Resolution::NotFound,
        LookupErrorKind::Again => Resolution::Timeout,
        other => Resolution::Failed(format!("{other:?}")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Entries live for the whole process.
    NoEviction,
    /// Entries older than the duration are looked up again.
    Ttl(Duration),
}

impl CachePolicy {
    pub fn from_ttl_secs(ttl: Option<u64>) -> Self {
        match ttl {
            Some(secs) => CachePolicy::Ttl(Duration::from_secs(secs)),
            None => CachePolicy::NoEviction,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Debug)]
struct CacheEntry {
    service: String,
    inserted: Instant,
}

/// Resolved services keyed by IP. Not thread-safe: the read-then-insert in
/// `AddressClassifier::classify_service` assumes a single caller.
#[derive(Debug)]
pub struct ServiceCache {
    policy: CachePolicy,
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

impl ServiceCache {
    pub fn new(policy: CachePolicy) -> Self {
        ServiceCache {
            policy,
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(&mut self, ip: &str) -> Option<&str> {
        let expired = match (self.entries.get(ip), self.policy) {
            (None, _) => {
                self.misses += 1;
                return None;
            }
            (Some(_), CachePolicy::NoEviction) => false,
            (Some(entry), CachePolicy::Ttl(ttl)) => entry.inserted.elapsed() >= ttl,
        };
        if expired {
            self.entries.remove(ip);
            self.misses += 1;
            return None;
        }
        self.hits += 1;
        self.entries.get(ip).map(|entry| entry.service.as_str())
    }

    pub fn insert(&mut self, ip: &str, service: &str) {
        self.entries.insert(
            ip.to_string(),
            CacheEntry {
                service: service.to_string(),
                inserted: Instant::now(),
            },
        );
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.entries.len(),
        }
    }
}

pub struct AddressClassifier<R> {
    rules: ClassifierConfig,
    resolver: R,
    cache: ServiceCache,
}

impl<R: ReverseResolver> AddressClassifier<R> {
    pub fn new(rules: ClassifierConfig, resolver: R, cache: ServiceCache) -> Self {
        AddressClassifier {
            rules,
            resolver,
            cache,
        }
    }

    /// Builds a classifier whose cache policy comes from the rules' TTL.
    pub fn from_config(rules: ClassifierConfig, resolver: R) -> Self {
        let cache = ServiceCache::new(CachePolicy::from_ttl_secs(rules.cache_ttl_secs));
        Self::new(rules, resolver, cache)
    }

    /// Never fails: lookup errors degrade to [`UNKNOWN`].
    pub fn classify_service(&mut self, ip: &str) -> String {
        // Exception addresses never enter the cache, so they are answered
        // from the set without touching its hit/miss counters.
        if self.rules.exception_ips.contains(ip) {
            return self.rules.exception_label.clone();
        }

        if let Some(service) = self.cache.get(ip) {
            return service.to_string();
        }

        let service = match self.resolver.reverse(ip) {
            Resolution::Resolved(hostname) => self.service_for_hostname(&hostname).to_string(),
            failure => {
                debug!(ip, outcome = ?failure, "reverse lookup failed");
                UNKNOWN.to_string()
            }
        };

        self.cache.insert(ip, &service);
        service
    }

    /// Last matching hostname prefix wins, unlike datacenter matching.
    fn service_for_hostname(&self, hostname: &str) -> &str {
        self.rules
            .service_prefixes
            .iter()
            .rev()
            .find(|entry| hostname.starts_with(&entry.prefix))
            .map_or(OTHER, |entry| entry.service.as_str())
    }

    /// First matching IP prefix wins. Uncached.
    pub fn classify_datacenter(&self, ip: &str) -> &str {
        self.rules
            .datacenter_prefixes
            .iter()
            .find(|entry| ip.starts_with(&entry.prefix))
            .map_or(OTHER, |entry| entry.datacenter.as_str())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

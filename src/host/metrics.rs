//! Per request type counters

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Point in a request's life that gets counted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestEvent {
    Received,
    ResponseSent,
    HandlerException,
}

/// Counters for one request type
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RequestTypeStats {
    pub received: u64,
    pub response_sent: u64,
    pub handler_exception: u64,
}

impl RequestTypeStats {
    /// Percentage of received requests whose handler failed
    pub fn failure_rate(&self) -> f64 {
        if self.received == 0 {
            0.0
        } else {
            (self.handler_exception as f64 / self.received as f64) * 100.0
        }
    }
}

/// Request counts recorded by the host, keyed by request type
#[derive(Debug, Default)]
pub struct RequestCounts {
    by_type: Mutex<HashMap<String, RequestTypeStats>>,
}

impl RequestCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, request_type: &str, event: RequestEvent) {
        let mut by_type = self.by_type.lock().unwrap_or_else(PoisonError::into_inner);
        let stats = by_type.entry(request_type.to_string()).or_default();
        match event {
            RequestEvent::Received => stats.received += 1,
            RequestEvent::ResponseSent => stats.response_sent += 1,
            RequestEvent::HandlerException => stats.handler_exception += 1,
        }
    }

    pub fn get(&self, request_type: &str) -> RequestTypeStats {
        self.by_type
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(request_type)
            .cloned()
            .unwrap_or_default()
    }

    pub fn count(&self, request_type: &str, event: RequestEvent) -> u64 {
        let stats = self.get(request_type);
        match event {
            RequestEvent::Received => stats.received,
            RequestEvent::ResponseSent => stats.response_sent,
            RequestEvent::HandlerException => stats.handler_exception,
        }
    }

    /// Sum of `event` across all request types
    pub fn total(&self, event: RequestEvent) -> u64 {
        self.by_type
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|stats| match event {
                RequestEvent::Received => stats.received,
                RequestEvent::ResponseSent => stats.response_sent,
                RequestEvent::HandlerException => stats.handler_exception,
            })
            .sum()
    }

    /// All counters, sorted by request type
    pub fn snapshot(&self) -> Vec<(String, RequestTypeStats)> {
        let mut entries: Vec<(String, RequestTypeStats)> = self
            .by_type
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, stats)| (name.clone(), stats.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

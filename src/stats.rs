//! Per-slave request statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::ExceptionCode;

/// Error counters broken down by exception kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCounts {
    pub illegal_function: u64,
    pub illegal_data_address: u64,
    pub illegal_data_value: u64,
    pub slave_device_failure: u64,
}

impl ErrorCounts {
    /// Increment the counter for `code`
    pub fn record(&mut self, code: ExceptionCode) {
        let counter = match code {
            ExceptionCode::IllegalFunction => &mut self.illegal_function,
            ExceptionCode::IllegalDataAddress => &mut self.illegal_data_address,
            ExceptionCode::IllegalDataValue => &mut self.illegal_data_value,
            ExceptionCode::SlaveDeviceFailure => &mut self.slave_device_failure,
        };
        *counter = counter.saturating_add(1);
    }

    /// Counter for a single exception kind
    pub fn get(&self, code: ExceptionCode) -> u64 {
        match code {
            ExceptionCode::IllegalFunction => self.illegal_function,
            ExceptionCode::IllegalDataAddress => self.illegal_data_address,
            ExceptionCode::IllegalDataValue => self.illegal_data_value,
            ExceptionCode::SlaveDeviceFailure => self.slave_device_failure,
        }
    }

    /// Sum over all exception kinds
    pub fn total(&self) -> u64 {
        self.illegal_function
            + self.illegal_data_address
            + self.illegal_data_value
            + self.slave_device_failure
    }
}

/// Request counters of one slave.
///
/// Counters only grow while the slave is registered; removing and re-adding a slave
/// starts from zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub error_requests: ErrorCounts,
    pub last_request_timestamp: Option<DateTime<Utc>>,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl Statistics {
    /// Count an observed request. Called before the request is executed.
    pub fn record_request(&mut self, at: DateTime<Utc>) {
        self.total_requests = self.total_requests.saturating_add(1);
        self.last_request_timestamp = Some(at);
    }

    pub fn record_success(&mut self) {
        self.successful_requests = self.successful_requests.saturating_add(1);
    }

    pub fn record_error(&mut self, code: ExceptionCode) {
        self.error_requests.record(code);
    }

    /// Account raw frame sizes on the wire
    pub fn record_traffic(&mut self, bytes_in: usize, bytes_out: usize) {
        self.bytes_in = self.bytes_in.saturating_add(bytes_in as u64);
        self.bytes_out = self.bytes_out.saturating_add(bytes_out as u64);
    }

    /// Successful requests as a percentage of all requests
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.successful_requests as f64 / self.total_requests as f64 * 100.0
    }

    /// Add another slave's counters into this one (used for aggregate reports)
    pub fn accumulate(&mut self, other: &Statistics) {
        self.total_requests += other.total_requests;
        self.successful_requests += other.successful_requests;
        self.error_requests.illegal_function += other.error_requests.illegal_function;
        self.error_requests.illegal_data_address += other.error_requests.illegal_data_address;
        self.error_requests.illegal_data_value += other.error_requests.illegal_data_value;
        self.error_requests.slave_device_failure += other.error_requests.slave_device_failure;
        self.bytes_in += other.bytes_in;
        self.bytes_out += other.bytes_out;
        self.last_request_timestamp = self.last_request_timestamp.max(other.last_request_timestamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let mut stats = Statistics::default();
        let now = Utc::now();
        for _ in 0..10 {
            stats.record_request(now);
            stats.record_success();
        }
        stats.record_request(now);
        stats.record_error(ExceptionCode::IllegalDataAddress);
        stats.record_request(now);
        stats.record_error(ExceptionCode::IllegalDataAddress);
        stats.record_request(now);
        stats.record_error(ExceptionCode::IllegalFunction);

        assert_eq!(stats.total_requests, 13);
        assert_eq!(stats.successful_requests, 10);
        assert_eq!(stats.error_requests.total(), 3);
        assert_eq!(stats.error_requests.get(ExceptionCode::IllegalDataAddress), 2);
        assert_eq!(stats.last_request_timestamp, Some(now));
    }

    #[test]
    fn test_success_rate() {
        let mut stats = Statistics::default();
        assert_eq!(stats.success_rate(), 0.0);
        stats.total_requests = 4;
        stats.successful_requests = 3;
        assert!((stats.success_rate() - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_accumulate() {
        let mut total = Statistics::default();
        let mut a = Statistics::default();
        a.total_requests = 5;
        a.bytes_in = 40;
        a.error_requests.illegal_data_value = 1;
        total.accumulate(&a);
        total.accumulate(&a);
        assert_eq!(total.total_requests, 10);
        assert_eq!(total.bytes_in, 80);
        assert_eq!(total.error_requests.total(), 2);
    }
}

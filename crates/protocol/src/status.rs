//! Vendor status codes
//!
//! 2xxxxxxx success, 4xxxxxxx client error, 5xxxxxxx server error.

pub const SUCCESS: u32 = 2000_0000;
pub const TASK_FAILED: u32 = 4000_0000;
pub const INVALID_PARAMETER: u32 = 4000_0001;
pub const AUTHENTICATION_FAILED: u32 = 4010_0005;
pub const QUOTA_EXCEEDED: u32 = 4030_0016;
pub const INTERNAL_ERROR: u32 = 5000_0000;
pub const SERVICE_UNAVAILABLE: u32 = 5030_0018;

/// Status message carried alongside successful frames
pub const SUCCESS_MESSAGE: &str = "GATEWAY|SUCCESS|Success.";

pub fn is_success(status: u32) -> bool {
    (2000_0000..3000_0000).contains(&status)
}

pub fn is_client_error(status: u32) -> bool {
    (4000_0000..5000_0000).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes() {
        assert!(is_success(SUCCESS));
        assert!(!is_success(TASK_FAILED));
        assert!(is_client_error(INVALID_PARAMETER));
        assert!(is_client_error(QUOTA_EXCEEDED));
        assert!(!is_client_error(SERVICE_UNAVAILABLE));
        assert!(!is_client_error(SUCCESS));
    }
}

pub const ROUTE_INDEX: &str = "/";
pub const ROUTE_STATUS: &str = "/api/status";

pub const ROUTE_SET_TIME: &str = "/set-time";
pub const ROUTE_SET_GPS: &str = "/set-gps";
pub const ROUTE_SET_INTERVAL: &str = "/set-interval";

pub const ROUTE_DOWNLOAD: &str = "/download";
pub const ROUTE_DELETE: &str = "/delete";
pub const ROUTE_START: &str = "/start-measurements";

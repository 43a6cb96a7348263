pub mod health_scan;
pub mod http_probe;
pub mod runbook;

pub use health_scan::HealthScanTool;
pub use http_probe::HttpProbeTool;
pub use runbook::RunbookTool;

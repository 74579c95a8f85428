pub mod bcd;
pub mod dlms;
pub mod dlt645;
pub mod heartbeat;
pub mod ivy;
pub mod router;
pub mod telemetry;

/// Certificate expiry and strength from the certificate store
pub mod cert_collector;

/// One monitoring cycle across every collector
pub mod health_collector;

/// HTTP(S) probes of the configured sites
pub mod site_collector;

/// CPU, memory, disk, server process and TCP states
pub mod system_collector;

pub use cert_collector::{CertCollector, CertificateInfo};
pub use health_collector::{monitored_sites, CollectScope, Collection, CollectorFailure, HealthCollector};
pub use site_collector::{SiteProbe, SiteStatus};
pub use system_collector::SystemCollector;

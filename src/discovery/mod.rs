//! # Discovery Module
//!
//! Finds hosts on the local network and keeps a list of the ones that are
//! still around. [`MdnsBrowser`] browses DNS-SD over multicast DNS; the
//! [`ServiceBrowser`] trait lets tests feed announcements directly.
//!
//! ```text
//! ServiceBrowser ──Found──► resolve (JoinSet) ──► HostTable.upsert  ─┐
//!       │                                                            ├─► watch<Vec<DiscoveredHost>>
//!       └──────Lost───────► HostTable.mark_lost (now + grace) ───────┤
//!                         sweep every 5s ─► drop expired entries ────┘
//! ```
//!
//! Lost hosts are not removed immediately: they stay visible for a grace
//! period (30 seconds by default) and disappear on the first sweep after it.

pub mod mdns;
pub mod service;
pub mod table;

pub use mdns::MdnsBrowser;
pub use service::{
    BrowseEvent, DiscoveryError, DiscoveryService, DiscoverySettings, ResolvedService,
    ServiceBrowser, ServiceRecord,
};
pub use table::{DiscoveredHost, HostTable};

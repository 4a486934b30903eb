//! End-to-end tests
//!
//! These run provider responses through the adapters, the download pipeline
//! and the library scanner without touching the network.

pub mod alist_cache;
pub mod engine;
pub mod index;
pub mod paths;
pub mod reconcile;
pub mod strm;
pub mod transfer;

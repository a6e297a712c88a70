pub mod audit;
pub mod bucket;
pub mod classify;
pub mod config;
pub mod consolidate;
pub mod daemon;
pub mod ffmpeg;
pub mod layout;
pub mod lock;
pub mod process;
pub mod purge;
pub mod retention;
pub mod supervisor;
pub mod util;
pub mod warn;

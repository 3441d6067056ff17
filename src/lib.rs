pub mod backend;
pub mod booth;
pub mod capture;
pub mod config;
pub mod error;
pub mod flow;
pub mod media;
pub mod notify;
pub mod observe;
pub mod photo;
pub mod playback;
pub mod preview;
pub mod rpicam;
pub mod validation;
pub mod virtual_camera;
pub mod vision;

#[cfg(test)]
mod testing;

pub use booth::TryOnBooth;
pub use config::Config;
pub use error::TryOnError;

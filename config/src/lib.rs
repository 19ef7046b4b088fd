pub mod paths;
pub mod settings;

pub use paths::PathManager;
pub use settings::{Settings, TransportSettings};

pub mod profile;
pub mod types;

pub use profile::{Profile, ProfileStore};
pub use types::{ClashConfig, GroupDef, ProxyDef, load_config, parse_config};

//! Pages served by both platforms, embedded at build time.

pub const INDEX_HTML: &str = include_str!("../web/index.html");
pub const STYLE_CSS: &str = include_str!("../web/style.css");
pub const INDEX_JS: &str = include_str!("../web/index.js");
pub const WIFIMANAGER_HTML: &str = include_str!("../web/wifimanager.html");

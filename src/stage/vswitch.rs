//! The cat9kv UADP switch definition embedded in the node-definition YAML.

use once_cell::sync::Lazy;
use regex::Regex;

/// File name of the node definition carrying the switch definition.
pub const NODE_DEFINITION: &str = "cat9000v_uadp.yaml";

/// Name vrnetlab's cat9kv builder expects next to the image.
pub const VSWITCH_FILE: &str = "vswitch.xml";

const YAML_INDENT: &str = "          ";

static VSWITCH_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)name: conf/vswitch\.xml\s+content: \|-\s+(.*?)\s+editable:").unwrap()
});

/// Pull the `conf/vswitch.xml` block scalar out of the node definition.
pub fn extract_vswitch_xml(yaml: &str) -> Option<String> {
    let body = VSWITCH_BLOCK.captures(yaml)?.get(1)?.as_str();
    let lines: Vec<&str> = body
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.strip_prefix(YAML_INDENT)
                .unwrap_or_else(|| line.trim_start())
        })
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

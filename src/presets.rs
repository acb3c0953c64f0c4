//! Built-in endpoint lists that can be loaded without any input.

/// A named, built-in endpoint list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preset {
    pub key: &'static str,
    pub label: &'static str,
    pub raw: &'static str,
}

const DEFAULT_LIST: &str = "
8.210.83.33:1080
47.243.95.228:1080
103.152.112.162:1080
43.153.207.93:1080
188.166.197.129:1080
51.79.52.80:3080
72.195.34.59:4145
98.162.25.23:4145
";

const US_NODES: &str = "
104.248.50.10:1080
167.99.241.20:1080
178.128.144.30:8080
206.189.12.60:1080
51.15.227.230:1080
139.59.53.110:1080
165.227.215.70:1080
159.65.162.20:1080
";

const EU_NODES: &str = "
45.55.133.20:1080
192.241.155.30:1080
138.197.144.40:1080
104.236.222.50:1080
165.22.222.60:1080
128.199.222.70:1080
178.62.222.80:1080
";

pub const PRESETS: &[Preset] = &[
    Preset {
        key: "default",
        label: "Default list",
        raw: DEFAULT_LIST,
    },
    Preset {
        key: "us",
        label: "US Nodes",
        raw: US_NODES,
    },
    Preset {
        key: "eu",
        label: "EU Nodes",
        raw: EU_NODES,
    },
];

/// Look up a preset by key, case-insensitively.
pub fn find(key: &str) -> Option<&'static Preset> {
    PRESETS.iter().find(|p| p.key.eq_ignore_ascii_case(key))
}

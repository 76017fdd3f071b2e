use std::env;
use std::fs;
use std::path::Path;

fn main() {
    // Create config template if it doesn't exist
    let out_dir = env::var("OUT_DIR").unwrap_or_else(|_| "./".to_string());
    let template_path = Path::new(&out_dir).join("../../../vdkmux.template.toml");

    let template = r#"# vdkmux multiplexer configuration template
# Copy this file to 'vdkmux.toml' and adjust the values

# Output clock quantum in 90kHz ticks (4500 = 50ms)
pcr_period = 4500

# Output bitrate in bits per second
bitrate = 20000000

# Pad each period with null packets up to the bitrate
fixed_bitrate = true

# Frame slots shared by all streams of one multiplexer
max_buffers = 512

# 1 = PAT/PMT, 4 = SDT
table_generation = 1
"#;

    let _ = fs::write(template_path, template);
    println!("cargo:rerun-if-changed=build.rs");
}

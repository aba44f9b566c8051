//! ---
//! mtr_section: "01-core-functionality"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Shared primitives and utilities for the hub runtime."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
use vergen::EmitBuilder;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    EmitBuilder::builder()
        .fail_on_error()
        .all_build()
        .all_cargo()
        .emit()?;

    println!("cargo:rerun-if-changed=build.rs");
    Ok(())
}

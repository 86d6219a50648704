/// Build script: validate that the host targets Windows.
///
/// The whole program is built around the NT handle table and cross-process
/// handle duplication; there is nothing meaningful to compile elsewhere.
fn main() {
    // Hard gate: fail loudly on any other target rather than silently
    // producing a broken binary.
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os != "windows" {
        panic!(
            "d2r-handle-closer only builds for Windows \
             (CARGO_CFG_TARGET_OS = {target_os:?})"
        );
    }

    // Only re-run the build script when it changes.
    println!("cargo:rerun-if-changed=build.rs");
}

//! The build script shared by every kernel crate.
//!
//! Build-time options are Cargo features of `kernel_config`, so the only job
//! left here is to rebuild when the kernel configuration in the environment changes.

fn main() {
    println!("cargo:rerun-if-env-changed=KERNEL_CONFIG");
}

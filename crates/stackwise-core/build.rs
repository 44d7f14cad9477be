//! Build script for stackwise-core
//!
//! This script checks system requirements before compilation:
//! - Minimum Rust version
//! - Platform-specific requirements (macOS version)
//!
//! ## Requirements
//!
//! - **Rust**: 1.82.0 or newer (`Option::is_none_or`, inline `asm!` on stable)
//! - **macOS**: 10.9+ (Mavericks) for Intel, 11.0+ (Big Sur) for Apple Silicon
//! - **Linux**: any kernel exposing `/proc/self/maps`

fn main()
{
    println!("cargo:rerun-if-changed=build.rs");

    match rustc_version::version() {
        Ok(rustc_version) => {
            let min_rust_version = rustc_version::Version::new(1, 82, 0);
            if rustc_version < min_rust_version {
                panic!("stackwise-core requires Rust {min_rust_version} or newer, found {rustc_version}");
            }
        }
        // Some build environments hide the compiler version
        Err(_) => println!("cargo:warning=could not verify Rust version"),
    }

    #[cfg(target_os = "macos")]
    check_macos_requirements();
}

#[cfg(target_os = "macos")]
fn check_macos_requirements()
{
    // dyld image enumeration and pthread_get_stackaddr_np are available from
    // 10.9 on; Apple Silicon starts at Big Sur.
    let min_macos_version = if cfg!(target_arch = "aarch64") { (11, 0, 0) } else { (10, 9, 0) };

    match get_macos_version() {
        Some(version) if version < min_macos_version => {
            panic!(
                "stackwise-core requires macOS {}.{}.{} or newer, found {}.{}.{}",
                min_macos_version.0, min_macos_version.1, min_macos_version.2, version.0, version.1, version.2
            );
        }
        Some(_) => {}
        // Might be cross-compiling
        None => println!("cargo:warning=could not detect macOS version"),
    }
}

#[cfg(target_os = "macos")]
fn get_macos_version() -> Option<(u32, u32, u32)>
{
    use std::process::Command;

    let output = Command::new("sw_vers").arg("-productVersion").output().ok()?;
    let version_str = String::from_utf8(output.stdout).ok()?;

    // e.g. "14.2.1" or "11.0"
    let mut parts = version_str.trim().split('.');
    let major = parts.next()?.parse::<u32>().ok()?;
    let minor = parts.next()?.parse::<u32>().ok()?;
    let patch = parts.next().and_then(|s| s.parse::<u32>().ok()).unwrap_or(0);

    Some((major, minor, patch))
}

fn main() {
    // ── macOS: embed Info.plist so CoreBluetooth lets the CLI scan ───────────
    //
    // CBCentralManager stays "unauthorised" for a bare executable unless the
    // binary carries an Info.plist with NSBluetoothAlwaysUsageDescription.
    // The plist is linked into the __TEXT,__info_plist section, which macOS
    // reads the same way it reads an app bundle's Info.plist.
    //
    // `CARGO_CFG_TARGET_OS` is the target, not the host, so cross builds
    // from Linux pick this up as well.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("macos") {
        let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
            return;
        };
        let plist = format!("{dir}/Info.plist");

        // ld … -sectcreate __TEXT __info_plist /path/to/Info.plist …
        for arg in ["-sectcreate", "__TEXT", "__info_plist", plist.as_str()] {
            println!("cargo:rustc-link-arg-bins={arg}");
        }
        println!("cargo:rerun-if-changed=Info.plist");
    }
}

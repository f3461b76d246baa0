fn main() {
    // ── macOS: Bluetooth usage description ────────────────────────────────────
    //
    // CoreBluetooth keeps the central manager unauthorised, and every scan
    // returns nothing, unless the process carries an Info.plist with
    // NSBluetoothAlwaysUsageDescription.  A bare CLI binary has no bundle, so
    // the plist is linked into the __TEXT,__info_plist section instead.
    //
    // CARGO_CFG_TARGET_OS is the target, so cross builds get the section too.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("macos") {
        return;
    }
    let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        println!("cargo:warning=CARGO_MANIFEST_DIR unset, Info.plist not embedded");
        return;
    };
    for arg in ["-sectcreate", "__TEXT", "__info_plist", &format!("{dir}/Info.plist")] {
        println!("cargo:rustc-link-arg-bins={arg}");
    }
    println!("cargo:rerun-if-changed=Info.plist");
}

fn main() {
    // ── macOS: Bluetooth permission for the `soundmeter` CLI ──────────────────
    //
    // CoreBluetooth never powers on for a bare command-line binary: the central
    // manager sits in the "unauthorised" state and every scan comes back empty
    // unless the executable carries an Info.plist with
    // NSBluetoothAlwaysUsageDescription.
    //
    // A CLI has no app bundle, so the plist is linked straight into the
    // `__TEXT,__info_plist` section with `-sectcreate`, where the loader
    // looks for it.
    //
    // `CARGO_CFG_TARGET_OS` is the target OS, so cross builds pick this up too.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("macos") {
        return;
    }

    let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        println!("cargo:warning=CARGO_MANIFEST_DIR unset; Info.plist not embedded");
        return;
    };
    let plist = format!("{dir}/Info.plist");

    for arg in ["-sectcreate", "__TEXT", "__info_plist", plist.as_str()] {
        println!("cargo:rustc-link-arg-bins={arg}");
    }
    println!("cargo:rerun-if-changed=Info.plist");
}

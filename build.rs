fn main() {
    let os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();

    // Only the Linux x86_64 probe is written in assembly; Windows probes go
    // through ReadProcessMemory/WriteProcessMemory instead.
    if os == "linux" && arch == "x86_64" {
        cc::Build::new()
            .file("asm/probe_x86_64.s")
            .compile("antiprofiler_asm");
    }

    println!("cargo:rerun-if-changed=asm/probe_x86_64.s");
    println!("cargo:rerun-if-changed=build.rs");
}

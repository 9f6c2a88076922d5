use anti_profiler_framework::detectors::ChannelOutcome;
use anti_profiler_framework::{self as apf, platform, Config};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("==================================================");
    println!("        Managed Runtime Profiler Guard            ");
    println!("             Diagnostic Host                      ");
    println!("==================================================");

    let mitigate = std::env::args().skip(1).any(|arg| arg == "--mitigate");

    // ===================================================================
    // CONFIGURATION
    // ===================================================================

    println!("\n[*] Phase 0: Configuration");
    let config = Config::from_env();
    match &config.runtime {
        Some(target) => println!("    Runtime override: {} v{}", target.module, target.version),
        None => println!("    Runtime: autodetect"),
    }
    println!(
        "    Eviction: {} ({} retries x {:?}, at most {:?})",
        if config.allow_eviction { "enabled" } else { "disabled" },
        config.retry_attempts,
        config.retry_interval,
        config.max_retry_wait()
    );

    // ===================================================================
    // RUNTIME DETECTION
    // ===================================================================

    println!("\n[*] Phase 1: Runtime Detection");
    match config.runtime.clone().or_else(platform::detect_runtime) {
        Some(target) => println!("    Found {} v{}", target.module, target.version),
        None => {
            println!("    No supported runtime in this process.");
            println!("    Set APF_RUNTIME_MODULE and APF_RUNTIME_VERSION to point at one.");
        }
    }

    // ===================================================================
    // INITIALIZATION
    // ===================================================================

    println!("\n[*] Phase 2: Locating Profiler Status");
    let located = apf::initialize_with(config);
    let Some(report) = apf::report() else {
        println!("    Initialization did not run.");
        return;
    };
    println!("    Model: {}", report.model.unwrap_or("none"));
    match report.status_address {
        Some(address) => println!("    Status at {:#x}", address),
        None => println!("    Status structure not found; guard is inert."),
    }

    if let Some(arbiter) = &report.arbiter {
        println!("\n[*] Phase 3: Attach Channel");
        println!("    Channel: {}", arbiter.channel);
        println!("    Mode downgraded: {}", arbiter.mode_downgraded);
        println!("    Timeout neutralized: {}", arbiter.timeout_neutralized);
        match arbiter.outcome {
            ChannelOutcome::Created => println!("[+] Channel created before the runtime."),
            ChannelOutcome::Evicted { attempts } => {
                println!("[+] Listener evicted after {} attempts.", attempts)
            }
            ChannelOutcome::Failed { attempts } => {
                println!("[!] Listener kept the channel after {} attempts.", attempts)
            }
            ChannelOutcome::Busy => println!("[!] Channel busy and eviction disabled."),
        }
    }

    // ===================================================================
    // ATTACH STATE
    // ===================================================================

    println!("\n[*] Phase 4: Attach State");
    println!("    Attached at initialization: {}", apf::was_profiler_attached());
    println!("    Attached now:               {}", apf::is_profiler_attached());
    if let Some(status) = apf::profiler_status() {
        println!("    Status: {:?}", status);
    }
    if let Some(mask) = apf::event_mask() {
        println!("    Event mask: {:#010x}", mask);
    }

    if mitigate && apf::is_profiler_attached() {
        println!("\n[*] Phase 5: Mitigation");
        apf::prevent_active_profiler_from_receiving_messages();
        println!("    Attached after mitigation: {}", apf::is_profiler_attached());
    }

    println!("\n==================================================");
    match (located, apf::was_profiler_attached()) {
        (false, _) => println!("[*] Verdict: Unknown (status not located)"),
        (true, true) => println!("[!] Verdict: Profiler was attached"),
        (true, false) => println!("[+] Verdict: Clean"),
    }
    println!("==================================================");
}

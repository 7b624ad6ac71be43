//! Veil - stealth memory patching demo tool.
//!
//! Attaches to a guest, patches a word of its memory, and keeps the patch
//! invisible: every read trapped on the patched location is answered with
//! the pre-patch value. With `--isolate`, demonstrates the alternate-view
//! mechanism instead: the patched frame is remapped onto a pristine
//! shadow copy inside an alternate view, so observers in that view never
//! see the modification at all.
//!
//! Only the built-in simulated guest driver is compiled in; it boots a
//! small canned guest whose scripted readers exercise the read shield. A
//! Xen or KVMi driver would slot in behind the same `Vmi` trait.
//!
//! SIGHUP, SIGTERM, SIGINT, and SIGALRM request shutdown; the patch is
//! restored and the guest resumed on every exit path.

use clap::Parser;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

use veil::patch::session::PatchSession;
use veil::view::ViewManager;
use veil::vmi::sim::{Observation, SimVmi};
use veil::vmi::{Vmi, PAGE_SHIFT, PAGE_SIZE};

#[derive(Parser, Debug)]
#[command(name = "veil")]
#[command(about = "Stealth memory patching and view isolation for VM introspection")]
struct Args {
    /// Name of the target VM
    name: String,

    /// Path to a KVMi transport socket (used by out-of-process drivers)
    #[arg(short, long)]
    socket: Option<String>,

    /// Guest symbol naming the word to patch and shield
    #[arg(long, default_value = "watched_entry")]
    symbol: String,

    /// Run the alternate-view isolation demo instead of the read shield
    #[arg(long)]
    isolate: bool,

    /// Event-loop poll interval in milliseconds
    #[arg(long, default_value = "500")]
    poll_ms: u64,
}

/// Set by the signal handler, observed between bounded waits.
static STOP: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_signal(_signo: i32) {
    STOP.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_signal_handlers() -> Result<(), Box<dyn std::error::Error>> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [
        Signal::SIGHUP,
        Signal::SIGTERM,
        Signal::SIGINT,
        Signal::SIGALRM,
    ] {
        unsafe { sigaction(signal, &action) }?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn install_signal_handlers() -> Result<(), Box<dyn std::error::Error>> {
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Where the canned guest keeps the watched word.
const TARGET_VA: u64 = 0x8000;

/// The value readers must keep observing after the patch.
const TRUE_VALUE: u32 = 0x0000_1234;

/// Boot the built-in simulated guest for `args.name`.
///
/// The guest exposes the target symbol and scripts three readers against
/// it: a 4-byte move, a 1-byte move, and a non-move instruction the
/// resolver refuses (so the third reader sees the real patched value).
fn attach(args: &Args) -> Result<SimVmi, Box<dyn std::error::Error>> {
    eprintln!("[VEIL] attaching to simulated guest '{}'", args.name);
    if let Some(ref socket) = args.socket {
        eprintln!("[VEIL] note: socket {socket} is not used by the built-in driver");
    }

    let mut vmi = SimVmi::new();
    vmi.define_symbol(&args.symbol, TARGET_VA);
    vmi.write_u32_va(TARGET_VA, 0, TRUE_VALUE)?;

    // mov eax, [rax]; mov al, [rax]; add eax, [rax]
    vmi.queue_read(TARGET_VA, &[0x8b, 0x00], 4);
    vmi.queue_read(TARGET_VA, &[0x8a, 0x00], 1);
    vmi.queue_read(TARGET_VA, &[0x03, 0x00], 4);
    Ok(vmi)
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    install_signal_handlers()?;

    let mut vmi = attach(&args)?;
    let location = vmi.translate_ksym(&args.symbol)?;
    eprintln!("[VEIL] target '{}' at {:#x}", args.symbol, location);

    if args.isolate {
        return run_isolation(vmi, location);
    }

    let mut session = PatchSession::new(vmi);
    session.pause()?;

    // Keep the outcome aside so teardown runs on the error path too.
    let outcome = shield(&mut session, location, args.poll_ms);
    session.shutdown();
    report(session.vmi_mut());
    outcome
}

/// Patch the target, protect its frame, and answer reads until a signal
/// arrives.
fn shield(
    session: &mut PatchSession<SimVmi>,
    location: u64,
    poll_ms: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    session.apply(location, 0)?;
    let gfn = session.protect()?;
    eprintln!("[VEIL] read shield armed on frame {gfn:#x}");

    session.resume()?;
    eprintln!("[VEIL] waiting for events (Ctrl-C to stop)...");
    session.run_until_stopped(&STOP, poll_ms)?;
    Ok(())
}

/// Print what each scripted reader actually observed.
fn report(vmi: &SimVmi) {
    for (i, observation) in vmi.observations().iter().enumerate() {
        match observation {
            Observation::Read(bytes) => {
                eprintln!("[VEIL] reader {i} observed {bytes:02x?}");
            }
            Observation::Access(mask) => {
                eprintln!("[VEIL] access {i} ({}) passed through", mask.render());
            }
            Observation::Fault(vector) => {
                eprintln!("[VEIL] access {i} received injected fault {vector}");
            }
        }
    }
}

/// Alternate-view demo: hide the patch behind a remapped shadow frame.
fn run_isolation(mut vmi: SimVmi, location: u64) -> Result<(), Box<dyn std::error::Error>> {
    let mut views = ViewManager::new();
    let baseline = views.init(&mut vmi)?;

    let outcome = isolate(&mut vmi, &mut views, location);
    views.teardown(&mut vmi, baseline);
    outcome
}

fn isolate(
    vmi: &mut SimVmi,
    views: &mut ViewManager,
    location: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    views.set_domain_state(vmi, true)?;
    let view = views.create_view(vmi)?;
    let shadow = views.reserve_page(vmi)?;
    let gfn = location >> PAGE_SHIFT;

    // Preserve the pristine frame in the shadow page, then patch the real
    // one. Observers in the alternate view are remapped onto the copy.
    let mut frame = vec![0u8; PAGE_SIZE as usize];
    vmi.read_phys(gfn << PAGE_SHIFT, &mut frame)?;
    vmi.write_phys(shadow << PAGE_SHIFT, &frame)?;

    let true_value = vmi.read_u32_va(location, 0)?;
    vmi.write_u32_va(location, 0, 0)?;
    vmi.pagecache_flush();
    views.remap(vmi, view, gfn, shadow)?;

    views.switch_view(vmi, view)?;
    let mut hidden = [0u8; 4];
    vmi.read_phys(location, &mut hidden)?;

    views.switch_view(vmi, 0)?;
    let mut real = [0u8; 4];
    vmi.read_phys(location, &mut real)?;

    eprintln!(
        "[VEIL] view {view}: observers read {:#010x}",
        u32::from_le_bytes(hidden)
    );
    eprintln!(
        "[VEIL] default view: memory holds {:#010x}",
        u32::from_le_bytes(real)
    );

    // Undo the patch before tearing the view down.
    vmi.write_u32_va(location, 0, true_value)?;
    vmi.pagecache_flush();
    Ok(())
}

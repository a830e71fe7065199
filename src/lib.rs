// Tone Engine - low-latency audio output
// Real-time stereo tone playback with latency tuning and device recovery

// Module declarations
pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod telemetry;

// Re-exports for convenience
pub use audio::{BufferSizeMode, CallbackTrace, SampleFormat, TuneAction};
pub use config::AppConfig;
pub use engine::{PlaybackEngine, RestartOutcome, StreamInfo};
pub use error::{AudioError, ErrorCode};

/// Install the process-wide tracing subscriber.
///
/// Safe to call more than once; later calls are ignored. `log` records
/// are forwarded into the same subscriber.
#[cfg(not(target_os = "android"))]
pub fn init_logging(max_level: tracing::Level) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(max_level)
        .with_target(false)
        .with_thread_names(true)
        .try_init();
}

/// Install the process-wide tracing subscriber, writing to logcat.
#[cfg(target_os = "android")]
pub fn init_logging(max_level: tracing::Level) {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::prelude::*;

    let layer = match tracing_android::layer("ToneEngine") {
        Ok(layer) => layer,
        Err(_) => return,
    };
    let _ = tracing_subscriber::registry()
        .with(layer.with_filter(LevelFilter::from_level(max_level)))
        .try_init();
}

/// JNI_OnLoad is called when the native library is loaded by Android
/// This function initializes the Android context required by oboe-rs
#[cfg(target_os = "android")]
#[no_mangle]
pub extern "system" fn JNI_OnLoad(
    vm: jni::JavaVM,
    _reserved: *mut std::ffi::c_void,
) -> jni::sys::jint {
    init_logging(tracing::Level::DEBUG);

    tracing::info!("JNI_OnLoad called - initializing Android context");

    // Must happen before any Oboe operation. No Java Context is available
    // this early; Oboe only needs the VM to open streams.
    // SAFETY: The JavaVM pointer is guaranteed to be valid by the Android runtime
    unsafe {
        ndk_context::initialize_android_context(
            vm.get_java_vm_pointer().cast(),
            std::ptr::null_mut(),
        );
    }

    tracing::info!("Android context initialized successfully");

    jni::sys::JNI_VERSION_1_6
}

//! Device selection, context and command queue.

use tracing::{debug, info, warn};

use crate::backend::{ComputeBackend, DeviceClass, DeviceInfo};
use crate::config::GpuConfig;
use crate::{KilnError, Result};

/// The selected device with its context and queue.
///
/// Every kernel operation takes a reference to this; nothing is global.
pub struct DeviceContext<B: ComputeBackend> {
    backend: B,
    class: DeviceClass,
    device: B::Device,
    info: DeviceInfo,
    context: B::Context,
    queue: B::Queue,
    compile_options: String,
}

impl<B: ComputeBackend> DeviceContext<B> {
    /// Select the first device of the configured class on the first platform
    /// exposing one, then create its context and queue.
    pub fn initialize(backend: B, config: &GpuConfig) -> Result<Self> {
        let class = config.device_class;
        let platforms = backend.platforms()?;
        if platforms.is_empty() {
            warn!("no compute platform found");
            return Err(KilnError::NoPlatform);
        }

        let mut selected = None;
        for platform in platforms {
            match backend.devices(platform, class) {
                Ok(devices) if !devices.is_empty() => {
                    selected = Some(devices[0]);
                    break;
                }
                Ok(_) => {}
                Err(e) => debug!("platform {:?} has no {} device: {}", platform, class, e),
            }
        }
        let Some(device) = selected else {
            warn!("no {} device found", class);
            return Err(KilnError::NoDevice { class });
        };

        let info = backend.device_info(device);
        if config.verbose {
            info!(
                "device {}: driver {}, {} endian, {} MB global memory",
                info.name,
                info.driver_version,
                if info.little_endian { "little" } else { "big" },
                info.global_memory / (1024 * 1024)
            );
        }

        let context = backend.create_context(device)?;
        let queue = match backend.create_queue(&context, device) {
            Ok(queue) => queue,
            Err(e) => {
                if let Err(release_err) = backend.release_context(context) {
                    warn!("failed to release context: {}", release_err);
                }
                return Err(e);
            }
        };

        Ok(Self {
            backend,
            class,
            device,
            info,
            context,
            queue,
            compile_options: config.compile_options(),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    pub fn device(&self) -> B::Device {
        self.device
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn context(&self) -> &B::Context {
        &self.context
    }

    pub fn queue(&self) -> &B::Queue {
        &self.queue
    }

    /// Options every program is compiled with.
    pub fn compile_options(&self) -> &str {
        &self.compile_options
    }

    /// Human-readable device description.
    pub fn id(&self) -> String {
        match self.class {
            DeviceClass::Gpu => format!("Graphics PU, {}", self.info.name),
            DeviceClass::Cpu => format!("OpenCL CPU, {}", self.info.name),
        }
    }

    /// Block until all enqueued work has completed.
    pub fn finish(&self) -> Result<()> {
        self.backend.finish(&self.queue).map_err(|e| {
            warn!("device reported failure while finishing: {}", e);
            e
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.backend.flush(&self.queue)
    }

    /// Flush, then wait for all enqueued work. Failures are logged.
    pub fn drain(&self) {
        if let Err(e) = self.backend.flush(&self.queue) {
            warn!("failed to flush queue: {}", e);
        }
        if let Err(e) = self.backend.finish(&self.queue) {
            warn!("failed to finish queue: {}", e);
        }
    }

    /// Release the queue, then the context.
    ///
    /// [`drain`](Self::drain) and release kernels before this. Every step is attempted.
    pub fn release(self) {
        if let Err(e) = self.backend.release_queue(self.queue) {
            warn!("failed to release queue: {}", e);
        }
        if let Err(e) = self.backend.release_context(self.context) {
            warn!("failed to release context: {}", e);
        }
        debug!("device context released");
    }
}

impl<B: ComputeBackend> std::fmt::Debug for DeviceContext<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("class", &self.class)
            .field("device", &self.device)
            .field("info", &self.info)
            .finish()
    }
}

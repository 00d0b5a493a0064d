use anyhow::bail;
use log::debug;

/// Register-bus primitive: 32-bit access to a control/status register by
/// symbolic name and instance index.
///
/// Implementations only provide the `_impl` methods; the provided wrappers do
/// the argument checks and tracing that every caller relies on.
pub trait RegisterBus: Send + Sync {
    fn read32_impl(&self, reg: &str, instance: u32) -> Result<u32, anyhow::Error>;
    fn write32_impl(&self, reg: &str, instance: u32, value: u32) -> Result<(), anyhow::Error>;

    fn read32(&self, reg: &str, instance: u32) -> Result<u32, anyhow::Error> {
        if reg.is_empty() {
            bail!("read of unnamed register (instance {})", instance);
        }
        let value = self.read32_impl(reg, instance)?;
        debug!("bus rd {}[{}] -> {:#010x}", reg, instance, value);
        Ok(value)
    }

    fn write32(&self, reg: &str, instance: u32, value: u32) -> Result<(), anyhow::Error> {
        if reg.is_empty() {
            bail!("write of unnamed register (instance {})", instance);
        }
        debug!("bus wr {}[{}] <- {:#010x}", reg, instance, value);
        self.write32_impl(reg, instance, value)
    }
}

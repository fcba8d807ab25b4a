use crate::error::Result;
use crate::frame::Frame;

/// Wall-clock time as reported by the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Timestamp {
    pub secs: u32,
    pub millis: u16,
}

impl Timestamp {
    pub fn new(secs: u32, millis: u16) -> Self {
        Self { secs, millis }
    }

    pub fn from_millis(total: u64) -> Self {
        Self {
            secs: (total / 1000) as u32,
            millis: (total % 1000) as u16,
        }
    }

    pub fn as_millis(&self) -> u64 {
        self.secs as u64 * 1000 + self.millis as u64
    }
}

/// Platform collaborator used by devices and controllers.
///
/// Every method must return immediately: the engine polls rather than waits.
pub trait Driver {
    /// Queue `frame` for transmission after `delay_ms` milliseconds (0 = now).
    fn send(&mut self, frame: &Frame, delay_ms: u32) -> Result<()>;

    /// Next received frame, `None` when nothing is available.
    fn recv(&mut self) -> Result<Option<Frame>>;

    fn get_time(&self) -> Timestamp;

    /// Set the platform clock. Only meaningful for the time authority.
    fn set_time(&mut self, _secs: u32) -> Result<()> {
        Ok(())
    }

    /// Fill `buf` with random bytes.
    fn entropy(&mut self, buf: &mut [u8]);
}

impl<D: Driver + ?Sized> Driver for &mut D {
    fn send(&mut self, frame: &Frame, delay_ms: u32) -> Result<()> {
        (**self).send(frame, delay_ms)
    }

    fn recv(&mut self) -> Result<Option<Frame>> {
        (**self).recv()
    }

    fn get_time(&self) -> Timestamp {
        (**self).get_time()
    }

    fn set_time(&mut self, secs: u32) -> Result<()> {
        (**self).set_time(secs)
    }

    fn entropy(&mut self, buf: &mut [u8]) {
        (**self).entropy(buf)
    }
}

/// Uniform value in `[min, max]` drawn from the driver's entropy source.
pub(crate) fn random_between<D: Driver + ?Sized>(driver: &mut D, min: u32, max: u32) -> u32 {
    if max <= min {
        return min;
    }
    let mut buf = [0u8; 4];
    driver.entropy(&mut buf);
    let span = (max - min) as u64 + 1;
    min + (u32::from_le_bytes(buf) as u64 % span) as u32
}

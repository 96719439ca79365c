//! USB Audio terminal types [USB Audio Terminal Types, Release 1.0].

#[repr(u16)]
#[non_exhaustive]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TerminalType {
    /// Terminal dealing with a USB audio stream.
    UsbStreaming = 0x0101,
    /// A generic loudspeaker.
    OutSpeaker = 0x0301,
}

impl From<TerminalType> for u16 {
    fn from(t: TerminalType) -> u16 {
        t as u16
    }
}

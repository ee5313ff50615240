/// Exception vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionVector(pub u8);

#[expect(non_upper_case_globals)]
impl ExceptionVector {
    /// Debug (#DB), raised after a single-stepped instruction.
    pub const DebugException: Self = Self(1);

    /// Breakpoint (#BP), raised by the `INT3` instruction.
    pub const Breakpoint: Self = Self(3);

    /// Invalid Opcode (#UD).
    pub const InvalidOpcode: Self = Self(6);

    /// Page Fault (#PF).
    pub const PageFault: Self = Self(14);
}

/// Type of interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptType {
    /// External interrupt.
    ExternalInterrupt,

    /// NMI.
    Nmi,

    /// Hardware exception.
    HardwareException,

    /// Software interrupt (CD nn).
    SoftwareInterrupt,

    /// INT3 (CC), INTO (CE).
    SoftwareException,
}

/// Information about an interrupt or exception.
#[derive(Debug, Clone, Copy)]
pub struct Interrupt {
    /// Vector number of the interrupt.
    pub vector: ExceptionVector,

    /// Type of interrupt.
    pub typ: InterruptType,

    /// Error code associated with the interrupt.
    pub error_code: u32,

    /// Length of the instruction that caused the interrupt.
    pub instruction_length: u8,
}

impl Interrupt {
    /// Creates a new software breakpoint exception.
    pub fn breakpoint(instruction_length: u8) -> Self {
        Self {
            vector: ExceptionVector::Breakpoint,
            typ: InterruptType::SoftwareException,
            error_code: 0xffff_ffff,
            instruction_length,
        }
    }

    /// Returns `true` if this is the exception raised by the trap opcode.
    pub fn is_software_breakpoint(&self) -> bool {
        self.vector == ExceptionVector::Breakpoint && self.typ == InterruptType::SoftwareException
    }
}

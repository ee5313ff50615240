use std::{ops::Deref, rc::Rc};

/// A snapshot of one guest page.
///
/// Cloning is cheap; the bytes are shared.
#[derive(Clone)]
pub struct VmiMappedPage(Rc<[u8]>);

impl VmiMappedPage {
    /// Creates a page snapshot from its bytes.
    pub fn new(content: impl Into<Rc<[u8]>>) -> Self {
        Self(content.into())
    }
}

impl From<Vec<u8>> for VmiMappedPage {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

impl Deref for VmiMappedPage {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Debug for VmiMappedPage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("VmiMappedPage")
            .field("len", &self.0.len())
            .finish()
    }
}

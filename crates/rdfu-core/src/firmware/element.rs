//! A single contiguous blob of firmware at a fixed address

/// One contiguous `(address, bytes)` region of an [`Image`](super::Image)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    contents: Vec<u8>,
    address: u32,
    target_size: u32,
}

impl Element {
    /// Create an element at address 0
    pub fn new(contents: Vec<u8>) -> Self {
        Self {
            contents,
            address: 0,
            target_size: 0,
        }
    }

    /// Create an element at a given address
    pub fn with_address(contents: Vec<u8>, address: u32) -> Self {
        Self {
            contents,
            address,
            target_size: 0,
        }
    }

    /// The element data, including any padding
    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    /// Replace the element data
    ///
    /// The data is padded again if a target size was set.
    pub fn set_contents(&mut self, contents: Vec<u8>) {
        self.contents = contents;
        self.pad();
    }

    /// Take ownership of the element data
    pub fn into_contents(self) -> Vec<u8> {
        self.contents
    }

    /// Load address of the first byte
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Set the load address
    pub fn set_address(&mut self, address: u32) {
        self.address = address;
    }

    /// Minimum size the contents are zero-padded to, or 0 for none
    pub fn target_size(&self) -> u32 {
        self.target_size
    }

    /// Zero-pad the contents up to `target_size` bytes
    ///
    /// Contents longer than `target_size` are left untouched.
    pub fn set_target_size(&mut self, target_size: u32) {
        self.target_size = target_size;
        self.pad();
    }

    /// Number of bytes in the element
    pub fn len(&self) -> usize {
        self.contents.len()
    }

    /// Whether the element holds no data
    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    /// Address one past the last byte
    pub fn end_address(&self) -> u64 {
        self.address as u64 + self.contents.len() as u64
    }

    fn pad(&mut self) {
        let target = self.target_size as usize;
        if self.contents.len() < target {
            self.contents.resize(target, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding_is_zero_fill() {
        let mut element = Element::with_address(vec![0xAA; 3], 0x1000);
        element.set_target_size(8);
        assert_eq!(element.contents(), &[0xAA, 0xAA, 0xAA, 0, 0, 0, 0, 0]);
        assert_eq!(element.end_address(), 0x1008);
    }

    #[test]
    fn test_padding_never_truncates() {
        let mut element = Element::new(vec![1, 2, 3, 4]);
        element.set_target_size(2);
        assert_eq!(element.contents(), &[1, 2, 3, 4]);

        element.set_target_size(6);
        element.set_contents(vec![9]);
        assert_eq!(element.contents(), &[9, 0, 0, 0, 0, 0]);
    }
}

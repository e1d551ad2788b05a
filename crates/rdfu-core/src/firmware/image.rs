//! Images: the per-target collection of elements

use super::Element;

/// Maximum stored length of an image name in bytes
pub const IMAGE_NAME_MAX: usize = 254;

/// An ordered list of elements destined for one alternate setting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Image {
    elements: Vec<Element>,
    alt_setting: u8,
    name: Option<String>,
}

impl Image {
    /// Create an empty image for alt-setting 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an image holding a single element
    pub fn from_element(element: Element) -> Self {
        Self {
            elements: vec![element],
            ..Self::default()
        }
    }

    /// All elements in order
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    /// Mutable access to the elements
    pub fn elements_mut(&mut self) -> &mut [Element] {
        &mut self.elements
    }

    /// Element by index
    pub fn element(&self, idx: usize) -> Option<&Element> {
        self.elements.get(idx)
    }

    /// Append an element
    pub fn add_element(&mut self, element: Element) {
        self.elements.push(element);
    }

    /// Alternate setting this image targets
    pub fn alt_setting(&self) -> u8 {
        self.alt_setting
    }

    /// Set the alternate setting
    pub fn set_alt_setting(&mut self, alt_setting: u8) {
        self.alt_setting = alt_setting;
    }

    /// Image name, if any
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Set the image name, truncated to [`IMAGE_NAME_MAX`] bytes
    pub fn set_name(&mut self, name: Option<&str>) {
        self.name = name.map(|n| {
            let mut end = n.len().min(IMAGE_NAME_MAX);
            while !n.is_char_boundary(end) {
                end -= 1;
            }
            n[..end].to_string()
        });
    }

    /// Sum of all element lengths
    pub fn size(&self) -> usize {
        self.elements.iter().map(Element::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_sums_elements() {
        let mut image = Image::new();
        image.add_element(Element::new(vec![0; 10]));
        image.add_element(Element::with_address(vec![0; 6], 0x100));
        assert_eq!(image.size(), 16);
        assert_eq!(image.element(1).map(Element::address), Some(0x100));
        assert!(image.element(2).is_none());
    }

    #[test]
    fn test_name_is_truncated() {
        let mut image = Image::new();
        let long = "x".repeat(300);
        image.set_name(Some(&long));
        assert_eq!(image.name().map(str::len), Some(IMAGE_NAME_MAX));

        // multi-byte character straddling the limit is dropped whole
        let mut tricky = "y".repeat(253);
        tricky.push('é');
        image.set_name(Some(&tricky));
        assert_eq!(image.name().map(str::len), Some(253));

        image.set_name(None);
        assert!(image.name().is_none());
    }
}

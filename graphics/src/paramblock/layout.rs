//! std140 / std430 layout of parameter blocks.
//!
//! Parameters are packed into 16 byte chunks in declaration order. Units in
//! the packing pass are 4-byte components:
//!
//! - a parameter's stride is its component count and its alignment equals the
//!   stride, except 3-component vectors which align to 4;
//! - matrices use one full chunk per vector;
//! - std140 arrays use one full chunk per entry, std430 arrays only pad
//!   3-component vectors to 4;
//! - a parameter that does not fit in the rest of the current chunk starts
//!   the next chunk.
//!
//! The element stride is then padded to 16 bytes (std140) or to the largest
//! parameter alignment (std430), and to the binding offset alignment for
//! non-compact blocks.

use crate::error::GraphicsError;

use super::parameter::Parameter;

/// Packing rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutRule {
    Std140,
    Std430,
}

/// Ordered parameter list with computed offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterBlockLayout {
    parameters: Vec<Parameter>,
    row_major: bool,
    compact: bool,
    rule: Option<LayoutRule>,
    element_stride: u32,
    offset_padding: u32,
}

impl Default for ParameterBlockLayout {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterBlockLayout {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
            row_major: false,
            compact: true,
            rule: None,
            element_stride: 0,
            offset_padding: 0,
        }
    }

    /// Append a parameter (builder style).
    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self.invalidate();
        self
    }

    pub fn with_row_major(mut self, row_major: bool) -> Self {
        self.set_row_major(row_major);
        self
    }

    /// Resize the parameter list. New parameters are single floats.
    pub fn set_parameter_count(&mut self, count: usize) {
        self.parameters.resize_with(count, Parameter::default);
        self.invalidate();
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters.len()
    }

    pub fn parameter(&self, index: usize) -> Result<&Parameter, GraphicsError> {
        self.parameters.get(index).ok_or_else(|| {
            GraphicsError::InvalidParameter(format!(
                "parameter index {index} out of range (count {})",
                self.parameters.len()
            ))
        })
    }

    /// Mutable access to a parameter. Invalidates the computed layout.
    pub fn parameter_mut(&mut self, index: usize) -> Result<&mut Parameter, GraphicsError> {
        self.invalidate();
        let count = self.parameters.len();
        self.parameters.get_mut(index).ok_or_else(|| {
            GraphicsError::InvalidParameter(format!(
                "parameter index {index} out of range (count {count})"
            ))
        })
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Matrices are stored as rows instead of columns.
    pub fn set_row_major(&mut self, row_major: bool) {
        if self.row_major != row_major {
            self.row_major = row_major;
            self.invalidate();
        }
    }

    pub fn row_major(&self) -> bool {
        self.row_major
    }

    /// Compact blocks do not pad elements to the binding offset alignment.
    pub fn set_compact(&mut self, compact: bool) {
        if self.compact != compact {
            self.compact = compact;
            self.invalidate();
        }
    }

    pub fn compact(&self) -> bool {
        self.compact
    }

    /// The rule the layout was computed with, `None` while unmapped.
    pub fn rule(&self) -> Option<LayoutRule> {
        self.rule
    }

    pub fn is_mapped(&self) -> bool {
        self.rule.is_some()
    }

    /// Bytes per element, 0 while unmapped.
    pub fn element_stride(&self) -> u32 {
        self.element_stride
    }

    /// Trailing bytes added to reach the binding offset alignment.
    pub fn offset_padding(&self) -> u32 {
        self.offset_padding
    }

    /// Number of vectors actually stored for a parameter and the number of
    /// components in each of them.
    pub(crate) fn storage_shape(&self, parameter: &Parameter) -> (u32, u32) {
        if parameter.is_matrix() && !self.row_major {
            (parameter.component_count(), parameter.vector_count())
        } else {
            (parameter.vector_count(), parameter.component_count())
        }
    }

    /// Compute offsets with the std140 rule.
    ///
    /// `alignment_requirement` is the binding offset alignment in bytes; it is
    /// ignored for compact layouts.
    pub fn map_to_std140(&mut self, alignment_requirement: u32) -> Result<(), GraphicsError> {
        self.map_to(LayoutRule::Std140, alignment_requirement)
    }

    /// Compute offsets with the std430 rule.
    pub fn map_to_std430(&mut self, alignment_requirement: u32) -> Result<(), GraphicsError> {
        self.map_to(LayoutRule::Std430, alignment_requirement)
    }

    fn invalidate(&mut self) {
        self.rule = None;
        self.element_stride = 0;
        self.offset_padding = 0;
    }

    fn map_to(&mut self, rule: LayoutRule, alignment_requirement: u32) -> Result<(), GraphicsError> {
        if self.parameters.is_empty() {
            return Err(GraphicsError::InvalidParameter(
                "parameter block layout has no parameters".to_string(),
            ));
        }
        for (index, parameter) in self.parameters.iter().enumerate() {
            parameter.validate(index)?;
        }

        let mut element_stride = 0u32; // bytes
        let mut chunk_offset = 0u32; // components inside the current vec4
        let mut max_alignment = 1u32; // components

        for index in 0..self.parameters.len() {
            let (vectors, components) = self.storage_shape(&self.parameters[index]);
            let array_count = self.parameters[index].array_count();

            let mut stride = components;
            let mut alignment = if stride == 3 { 4 } else { stride };

            if vectors > 1 {
                stride = 4;
                alignment = 4;
            }
            if array_count > 1 {
                match rule {
                    LayoutRule::Std140 => {
                        stride = 4;
                        alignment = 4;
                    }
                    LayoutRule::Std430 => {
                        if stride == 3 {
                            stride = 4;
                        }
                    }
                }
            }
            max_alignment = max_alignment.max(alignment);

            let adjust = (alignment - chunk_offset % alignment) % alignment;
            element_stride += adjust * 4;
            chunk_offset += adjust;

            if chunk_offset + stride > 4 {
                element_stride += (4 - chunk_offset) * 4;
                chunk_offset = 0;
            }

            let parameter = &mut self.parameters[index];
            parameter.offset = element_stride;
            parameter.vector_stride = stride * 4;
            parameter.array_stride = parameter.vector_stride * vectors;
            parameter.data_size = parameter.array_stride * array_count;

            element_stride += parameter.data_size;
            chunk_offset = (element_stride / 4) % 4;
        }

        let struct_alignment = match rule {
            LayoutRule::Std140 => 16,
            LayoutRule::Std430 => max_alignment * 4,
        };
        let mut stride = align_up(element_stride, struct_alignment);

        let mut padding = 0;
        if !self.compact && alignment_requirement > 0 {
            let aligned = align_up(stride, alignment_requirement);
            padding = aligned - stride;
            stride = aligned;
        }

        self.rule = Some(rule);
        self.element_stride = stride;
        self.offset_padding = padding;
        Ok(())
    }
}

/// Align `value` up to a multiple of `alignment`.
pub(crate) fn align_up(value: u32, alignment: u32) -> u32 {
    if alignment == 0 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paramblock::ValueType;

    fn layout(params: &[(ValueType, u32, u32, u32)]) -> ParameterBlockLayout {
        params
            .iter()
            .fold(ParameterBlockLayout::new(), |layout, &(t, c, v, a)| {
                layout.with_parameter(Parameter::new(t, c, v, a))
            })
    }

    #[test]
    fn test_single_vec4_is_16_bytes() {
        let mut layout = layout(&[(ValueType::Float, 4, 1, 1)]);
        layout.map_to_std140(0).unwrap();
        assert_eq!(layout.element_stride(), 16);
    }

    #[test]
    fn test_two_vec3_occupy_16_bytes_each() {
        let mut layout = layout(&[(ValueType::Float, 3, 1, 1), (ValueType::Float, 3, 1, 1)]);
        layout.map_to_std140(0).unwrap();
        assert_eq!(layout.parameters()[0].offset(), 0);
        assert_eq!(layout.parameters()[1].offset(), 16);
        assert_eq!(layout.element_stride(), 32);
    }

    #[test]
    fn test_vec3_then_scalar_packs_into_chunk() {
        let mut layout = layout(&[(ValueType::Float, 3, 1, 1), (ValueType::Int, 1, 1, 1)]);
        layout.map_to_std140(0).unwrap();
        assert_eq!(layout.parameters()[1].offset(), 12);
        assert_eq!(layout.element_stride(), 16);
    }

    #[test]
    fn test_vec2_alignment() {
        let mut layout = layout(&[
            (ValueType::Float, 1, 1, 1),
            (ValueType::Float, 2, 1, 1),
            (ValueType::Float, 1, 1, 1),
        ]);
        layout.map_to_std140(0).unwrap();
        assert_eq!(layout.parameters()[1].offset(), 8);
        assert_eq!(layout.parameters()[2].offset(), 16);
        assert_eq!(layout.element_stride(), 32);
    }

    #[test]
    fn test_mat4x3_column_major_and_row_major() {
        let mut column_major = layout(&[(ValueType::Float, 4, 3, 1), (ValueType::Float, 1, 1, 1)]);
        column_major.map_to_std140(0).unwrap();
        assert_eq!(column_major.parameters()[0].data_size(), 64);
        assert_eq!(column_major.parameters()[1].offset(), 64);

        let mut row_major = column_major.clone().with_row_major(true);
        row_major.map_to_std140(0).unwrap();
        assert_eq!(row_major.parameters()[0].data_size(), 48);
        assert_eq!(row_major.parameters()[1].offset(), 48);
    }

    #[test]
    fn test_std140_array_entries_padded() {
        let mut layout = layout(&[(ValueType::Float, 1, 1, 4), (ValueType::Float, 1, 1, 1)]);
        layout.map_to_std140(0).unwrap();
        assert_eq!(layout.parameters()[0].array_stride(), 16);
        assert_eq!(layout.parameters()[1].offset(), 64);
        assert_eq!(layout.element_stride(), 80);
    }

    #[test]
    fn test_std430_array_entries_tight() {
        let mut layout = layout(&[(ValueType::Float, 1, 1, 4), (ValueType::Float, 1, 1, 1)]);
        layout.map_to_std430(0).unwrap();
        assert_eq!(layout.parameters()[0].array_stride(), 4);
        assert_eq!(layout.parameters()[1].offset(), 16);
        assert_eq!(layout.element_stride(), 20);
    }

    #[test]
    fn test_non_compact_pads_to_alignment() {
        let mut layout = layout(&[(ValueType::Float, 4, 1, 1)]);
        layout.set_compact(false);
        layout.map_to_std140(256).unwrap();
        assert_eq!(layout.element_stride(), 256);
        assert_eq!(layout.offset_padding(), 240);
    }

    #[test]
    fn test_parameter_change_invalidates() {
        let mut layout = layout(&[(ValueType::Float, 4, 1, 1)]);
        layout.map_to_std140(0).unwrap();
        assert!(layout.is_mapped());
        layout
            .parameter_mut(0)
            .unwrap()
            .set_all(ValueType::Int, 2, 1, 1);
        assert!(!layout.is_mapped());
        assert_eq!(layout.element_stride(), 0);
    }

    #[test]
    fn test_empty_layout_fails() {
        let mut layout = ParameterBlockLayout::new();
        assert!(layout.map_to_std140(0).is_err());
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_up(5, 0), 5);
    }
}

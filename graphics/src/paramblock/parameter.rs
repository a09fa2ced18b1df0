//! Typed shader parameters and the values that can be written into them.

use ember_core::math::{Mat3, Mat3x4, Mat4, Vec2, Vec3, Vec4};

use crate::error::GraphicsError;

/// Scalar type of a parameter's components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ValueType {
    #[default]
    Float,
    Int,
    UInt,
    /// Stored as a 32-bit unsigned integer, 0 or 1.
    Bool,
}

impl ValueType {
    /// Whether values of type `other` can be stored in a parameter of this type.
    ///
    /// Signed and unsigned integers share the same 32-bit storage.
    pub fn accepts(self, other: ValueType) -> bool {
        match (self, other) {
            (Self::Int | Self::UInt, Self::Int | Self::UInt) => true,
            (a, b) => a == b,
        }
    }

    pub fn glsl_prefix(self) -> &'static str {
        match self {
            Self::Float => "",
            Self::Int => "i",
            Self::UInt => "u",
            Self::Bool => "b",
        }
    }
}

/// One parameter of a parameter block.
///
/// A parameter is declared with a value type, a component count (columns),
/// a vector count (rows, above 1 for matrices) and an array count. Offsets
/// and strides are filled in by the layout pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    value_type: ValueType,
    component_count: u32,
    vector_count: u32,
    array_count: u32,
    pub(crate) offset: u32,
    pub(crate) vector_stride: u32,
    pub(crate) array_stride: u32,
    pub(crate) data_size: u32,
}

impl Default for Parameter {
    fn default() -> Self {
        Self::new(ValueType::Float, 1, 1, 1)
    }
}

impl Parameter {
    pub fn new(
        value_type: ValueType,
        component_count: u32,
        vector_count: u32,
        array_count: u32,
    ) -> Self {
        Self {
            value_type,
            component_count,
            vector_count,
            array_count,
            offset: 0,
            vector_stride: 0,
            array_stride: 0,
            data_size: 0,
        }
    }

    /// Redeclare the parameter. Invalidates the computed layout.
    pub fn set_all(
        &mut self,
        value_type: ValueType,
        component_count: u32,
        vector_count: u32,
        array_count: u32,
    ) {
        *self = Self::new(value_type, component_count, vector_count, array_count);
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn component_count(&self) -> u32 {
        self.component_count
    }

    pub fn vector_count(&self) -> u32 {
        self.vector_count
    }

    pub fn array_count(&self) -> u32 {
        self.array_count
    }

    /// Byte offset inside an element.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Bytes between consecutive vectors (matrix rows or columns).
    pub fn vector_stride(&self) -> u32 {
        self.vector_stride
    }

    /// Bytes between consecutive array entries.
    pub fn array_stride(&self) -> u32 {
        self.array_stride
    }

    /// Total bytes covered by the parameter.
    pub fn data_size(&self) -> u32 {
        self.data_size
    }

    pub fn is_matrix(&self) -> bool {
        self.vector_count > 1
    }

    pub(crate) fn validate(&self, index: usize) -> Result<(), GraphicsError> {
        if !(1..=4).contains(&self.component_count) || !(1..=4).contains(&self.vector_count) {
            return Err(GraphicsError::InvalidParameter(format!(
                "parameter {index}: {}x{} components out of range",
                self.component_count, self.vector_count
            )));
        }
        if self.array_count == 0 {
            return Err(GraphicsError::InvalidParameter(format!(
                "parameter {index}: array count must be at least 1"
            )));
        }
        Ok(())
    }

    /// GLSL-like type name, for debug output.
    pub fn type_name(&self) -> String {
        let base = match (self.vector_count, self.component_count) {
            (1, 1) => match self.value_type {
                ValueType::Float => "float".to_string(),
                ValueType::Int => "int".to_string(),
                ValueType::UInt => "uint".to_string(),
                ValueType::Bool => "bool".to_string(),
            },
            (1, n) => format!("{}vec{n}", self.value_type.glsl_prefix()),
            (rows, columns) if rows == columns => format!("mat{rows}"),
            (rows, columns) => format!("mat{columns}x{rows}"),
        };
        if self.array_count > 1 {
            format!("{base}[{}]", self.array_count)
        } else {
            base
        }
    }
}

/// A value that can be written into a parameter.
///
/// `COLUMNS` is the component count and `ROWS` the vector count the target
/// parameter must be declared with.
pub trait ParameterData {
    const VALUE_TYPE: ValueType;
    const COLUMNS: u32;
    const ROWS: u32;

    /// Raw 32-bit bits of the component at (`row`, `column`).
    fn component_bits(&self, row: usize, column: usize) -> u32;
}

impl ParameterData for f32 {
    const VALUE_TYPE: ValueType = ValueType::Float;
    const COLUMNS: u32 = 1;
    const ROWS: u32 = 1;

    fn component_bits(&self, _row: usize, _column: usize) -> u32 {
        self.to_bits()
    }
}

impl ParameterData for i32 {
    const VALUE_TYPE: ValueType = ValueType::Int;
    const COLUMNS: u32 = 1;
    const ROWS: u32 = 1;

    fn component_bits(&self, _row: usize, _column: usize) -> u32 {
        *self as u32
    }
}

impl ParameterData for u32 {
    const VALUE_TYPE: ValueType = ValueType::UInt;
    const COLUMNS: u32 = 1;
    const ROWS: u32 = 1;

    fn component_bits(&self, _row: usize, _column: usize) -> u32 {
        *self
    }
}

impl ParameterData for bool {
    const VALUE_TYPE: ValueType = ValueType::Bool;
    const COLUMNS: u32 = 1;
    const ROWS: u32 = 1;

    fn component_bits(&self, _row: usize, _column: usize) -> u32 {
        u32::from(*self)
    }
}

macro_rules! impl_array_data {
    ($scalar:ty, $value_type:expr, $bits:expr, $($n:literal),+) => {
        $(
            impl ParameterData for [$scalar; $n] {
                const VALUE_TYPE: ValueType = $value_type;
                const COLUMNS: u32 = $n;
                const ROWS: u32 = 1;

                fn component_bits(&self, _row: usize, column: usize) -> u32 {
                    let bits: fn($scalar) -> u32 = $bits;
                    bits(self[column])
                }
            }
        )+
    };
}

impl_array_data!(f32, ValueType::Float, f32::to_bits, 2, 3, 4);
impl_array_data!(i32, ValueType::Int, |v| v as u32, 2, 3, 4);
impl_array_data!(u32, ValueType::UInt, |v| v, 2, 3, 4);
impl_array_data!(bool, ValueType::Bool, u32::from, 2, 3, 4);

macro_rules! impl_nalgebra_data {
    ($ty:ty, $rows:literal, $columns:literal) => {
        impl ParameterData for $ty {
            const VALUE_TYPE: ValueType = ValueType::Float;
            const COLUMNS: u32 = $columns;
            const ROWS: u32 = $rows;

            fn component_bits(&self, row: usize, column: usize) -> u32 {
                self[(row, column)].to_bits()
            }
        }
    };
}

// Vectors are a single row of N components.
impl ParameterData for Vec2 {
    const VALUE_TYPE: ValueType = ValueType::Float;
    const COLUMNS: u32 = 2;
    const ROWS: u32 = 1;

    fn component_bits(&self, _row: usize, column: usize) -> u32 {
        self[column].to_bits()
    }
}

impl ParameterData for Vec3 {
    const VALUE_TYPE: ValueType = ValueType::Float;
    const COLUMNS: u32 = 3;
    const ROWS: u32 = 1;

    fn component_bits(&self, _row: usize, column: usize) -> u32 {
        self[column].to_bits()
    }
}

impl ParameterData for Vec4 {
    const VALUE_TYPE: ValueType = ValueType::Float;
    const COLUMNS: u32 = 4;
    const ROWS: u32 = 1;

    fn component_bits(&self, _row: usize, column: usize) -> u32 {
        self[column].to_bits()
    }
}

impl_nalgebra_data!(Mat3, 3, 3);
impl_nalgebra_data!(Mat4, 4, 4);
impl_nalgebra_data!(Mat3x4, 3, 4);

//! Externally indexed key/value cache.
//!
//! One persistent buffer holds rotary-encoded keys and raw values for every
//! resident sequence across all layers, laid out as
//! `[slots, layers, {K, V}, max_len, heads, head_dim]`. It is allocated once,
//! never resized, and written at exactly one position per request per decode
//! call. The cache is addressed storage, not a queue: it does not enforce that
//! positions are filled in order.

use candle_core::{DType, Device, Tensor};
use half::f16;
use serde::{Deserialize, Serialize};

use crate::dtype::expect_rank;
use crate::error::{KernelError, Result};
use crate::traits::{LayeredBuffer, ValidateConfig};

const KEY: usize = 0;
const VALUE: usize = 1;

/// Geometry of a [`KvCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvCacheShape {
    /// Number of concurrently resident sequences.
    pub slots: usize,
    /// Number of transformer layers `L`.
    pub layers: usize,
    /// Positions per sequence, `MAXLEN`.
    pub max_len: usize,
    /// Attention heads `N`.
    pub heads: usize,
    /// Head dimension `D`.
    pub head_dim: usize,
}

impl KvCacheShape {
    /// Full 6-D shape `[slots, L, 2, MAXLEN, N, D]`.
    #[must_use]
    pub fn dims(&self) -> [usize; 6] {
        [
            self.slots,
            self.layers,
            2,
            self.max_len,
            self.heads,
            self.head_dim,
        ]
    }

    /// Elements in one position row (all heads).
    #[must_use]
    pub fn row_len(&self) -> usize {
        self.heads * self.head_dim
    }

    /// Total number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.dims().iter().product()
    }

    /// Offset of the K or V plane of `(slot, layer)`.
    fn plane_offset(&self, slot: usize, layer: usize, kv: usize) -> usize {
        ((slot * self.layers + layer) * 2 + kv) * self.max_len * self.row_len()
    }

    fn from_dims(dims: &[usize]) -> Result<Self> {
        if dims[2] != 2 {
            return Err(KernelError::DimensionMismatch {
                message: format!("kv buffer dim 2 must be 2 (K, V), got shape {dims:?}"),
            });
        }
        Ok(Self {
            slots: dims[0],
            layers: dims[1],
            max_len: dims[3],
            heads: dims[4],
            head_dim: dims[5],
        })
    }
}

impl ValidateConfig for KvCacheShape {
    fn validate(&self) -> Result<()> {
        if self.slots == 0
            || self.layers == 0
            || self.max_len == 0
            || self.heads == 0
            || self.head_dim == 0
        {
            return Err(KernelError::InvalidConfig(format!(
                "kv cache dimensions must all be > 0, got {:?}",
                self.dims()
            )));
        }
        Ok(())
    }
}

/// Borrowed history of one `(slot, layer)`: positions `0..len`.
///
/// Keys and values are contiguous `[len, heads, head_dim]` rows.
#[derive(Debug, Clone, Copy)]
pub struct KvHistory<'a> {
    keys: &'a [f16],
    values: &'a [f16],
    row_len: usize,
}

impl<'a> KvHistory<'a> {
    /// Number of positions in the history.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len() / self.row_len
    }

    /// Whether the history is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// All keys, `[len, heads, head_dim]`.
    #[must_use]
    pub fn keys(&self) -> &'a [f16] {
        self.keys
    }

    /// All values, `[len, heads, head_dim]`.
    #[must_use]
    pub fn values(&self) -> &'a [f16] {
        self.values
    }

    /// Key row at `position`.
    #[must_use]
    pub fn key(&self, position: usize) -> &'a [f16] {
        &self.keys[position * self.row_len..(position + 1) * self.row_len]
    }

    /// Value row at `position`.
    #[must_use]
    pub fn value(&self, position: usize) -> &'a [f16] {
        &self.values[position * self.row_len..(position + 1) * self.row_len]
    }
}

/// Persistent f16 KV cache buffer.
///
/// Mutation needs `&mut KvCache`, so two calls can never write the same
/// buffer concurrently; read-only sharing is free.
pub struct KvCache {
    data: Vec<f16>,
    shape: KvCacheShape,
}

impl KvCache {
    /// Allocate a zero-filled cache.
    ///
    /// # Errors
    /// Returns an error if any dimension is zero.
    pub fn new(shape: KvCacheShape) -> Result<Self> {
        shape.validate()?;
        let cache = Self {
            data: vec![f16::ZERO; shape.numel()],
            shape,
        };
        log::info!(
            "kv-cache init: slots={} layers={} max_len={} heads={} head_dim={} bytes={}",
            shape.slots,
            shape.layers,
            shape.max_len,
            shape.heads,
            shape.head_dim,
            cache.size_in_bytes()
        );
        Ok(cache)
    }

    /// Import a `[slots, L, 2, MAXLEN, N, D]` F16 tensor.
    ///
    /// # Errors
    /// Returns an error if the tensor is not 6-D F16 with a `2` at dim 2.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        if tensor.dtype() != DType::F16 {
            return Err(KernelError::UnsupportedDtype {
                op: "kv_cache",
                expected: "f16",
                actual: tensor.dtype(),
            });
        }
        let shape = KvCacheShape::from_dims(expect_rank(tensor, 6, "kvbuf")?)?;
        shape.validate()?;
        let data = tensor.flatten_all()?.to_vec1::<f16>()?;
        log::info!("kv-cache import: dims={:?}", shape.dims());
        Ok(Self { data, shape })
    }

    /// Export the buffer as a `[slots, L, 2, MAXLEN, N, D]` F16 tensor.
    ///
    /// # Errors
    /// Returns an error if the tensor cannot be created on `device`.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(&self.data, &self.shape.dims()[..], device)?)
    }

    /// Cache geometry.
    #[must_use]
    pub fn shape(&self) -> &KvCacheShape {
        &self.shape
    }

    /// Check a `(slot, layer, position)` address.
    ///
    /// # Errors
    /// Returns [`KernelError::OutOfRange`] for the first bad coordinate.
    pub fn check_address(&self, slot: usize, layer: usize, position: usize) -> Result<()> {
        if slot >= self.shape.slots {
            return Err(KernelError::out_of_range("slot", slot, self.shape.slots));
        }
        self.check_layer(layer)?;
        if position >= self.shape.max_len {
            return Err(KernelError::out_of_range(
                "position",
                position,
                self.shape.max_len,
            ));
        }
        Ok(())
    }

    /// Store an encoded key row and a value row at `(slot, layer, position)`.
    ///
    /// Both rows are `[heads, head_dim]`.
    ///
    /// # Errors
    /// Returns an error if the address is out of range or a row has the
    /// wrong length.
    pub fn write(
        &mut self,
        slot: usize,
        layer: usize,
        position: usize,
        key: &[f16],
        value: &[f16],
    ) -> Result<()> {
        self.check_address(slot, layer, position)?;
        let row_len = self.shape.row_len();
        if key.len() != row_len || value.len() != row_len {
            return Err(KernelError::DimensionMismatch {
                message: format!(
                    "kv rows must have {row_len} elements, got key={} value={}",
                    key.len(),
                    value.len()
                ),
            });
        }
        self.write_unchecked(slot, layer, position, key, value);
        Ok(())
    }

    /// Read positions `0..=position` of `(slot, layer)`.
    ///
    /// # Errors
    /// Returns [`KernelError::OutOfRange`] if the address is out of range.
    pub fn read_range(&self, slot: usize, layer: usize, position: usize) -> Result<KvHistory<'_>> {
        self.check_address(slot, layer, position)?;
        Ok(self.history_unchecked(slot, layer, position + 1))
    }

    /// Stored `(key, value)` rows at one position.
    ///
    /// # Errors
    /// Returns [`KernelError::OutOfRange`] if the address is out of range.
    pub fn entry(&self, slot: usize, layer: usize, position: usize) -> Result<(&[f16], &[f16])> {
        let history = self.read_range(slot, layer, position)?;
        Ok((history.key(position), history.value(position)))
    }

    /// Zero every layer of `slot` so it can host a new sequence.
    ///
    /// # Errors
    /// Returns [`KernelError::OutOfRange`] if `slot` is out of range.
    pub fn clear_slot(&mut self, slot: usize) -> Result<()> {
        if slot >= self.shape.slots {
            return Err(KernelError::out_of_range("slot", slot, self.shape.slots));
        }
        let start = self.shape.plane_offset(slot, 0, KEY);
        let end = self.shape.plane_offset(slot + 1, 0, KEY);
        self.data[start..end].fill(f16::ZERO);
        Ok(())
    }

    pub(crate) fn write_unchecked(
        &mut self,
        slot: usize,
        layer: usize,
        position: usize,
        key: &[f16],
        value: &[f16],
    ) {
        let row_len = self.shape.row_len();
        let k_off = self.shape.plane_offset(slot, layer, KEY) + position * row_len;
        let v_off = self.shape.plane_offset(slot, layer, VALUE) + position * row_len;
        self.data[k_off..k_off + row_len].copy_from_slice(key);
        self.data[v_off..v_off + row_len].copy_from_slice(value);
        log::trace!("kv-cache write slot={slot} layer={layer} position={position}");
    }

    pub(crate) fn history_unchecked(&self, slot: usize, layer: usize, len: usize) -> KvHistory<'_> {
        let row_len = self.shape.row_len();
        let k_off = self.shape.plane_offset(slot, layer, KEY);
        let v_off = self.shape.plane_offset(slot, layer, VALUE);
        KvHistory {
            keys: &self.data[k_off..k_off + len * row_len],
            values: &self.data[v_off..v_off + len * row_len],
            row_len,
        }
    }
}

impl std::fmt::Debug for KvCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvCache").field("shape", &self.shape).finish_non_exhaustive()
    }
}

impl LayeredBuffer for KvCache {
    fn dims(&self) -> Vec<usize> {
        self.shape.dims().to_vec()
    }

    fn dtype(&self) -> DType {
        DType::F16
    }

    fn num_layers(&self) -> usize {
        self.shape.layers
    }
}

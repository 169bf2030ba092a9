// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
use redex::cell::{CellPtr, CellValue, FrameId};
use redex::core::InstructionPointer;
use redex::stdlib::Builtin;

use crate::Machine;

impl Machine {
    /// Apply a builtin primitive to the top arguments of the current
    /// frame's stack. Arguments appear with the first declared argument
    /// topmost; the result replaces all of them. Only the arguments the
    /// dispatch table declares strict have been evaluated; the rest are
    /// passed through as unevaluated graphs.
    pub(crate) fn apply_builtin(
        &mut self,
        current: FrameId,
        address: InstructionPointer,
        builtin: Builtin,
    ) -> Result<(), String> {
        let info = builtin.info();
        let result = match builtin {
            Builtin::Add => {
                let (a, b) = self.numeric_args(current, address, builtin)?;
                self.alloc_number(a + b)
            }
            Builtin::Subtract => {
                let (a, b) = self.numeric_args(current, address, builtin)?;
                self.alloc_number(a - b)
            }
            Builtin::Multiply => {
                let (a, b) = self.numeric_args(current, address, builtin)?;
                self.alloc_number(a * b)
            }
            Builtin::Divide => {
                let (a, b) = self.numeric_args(current, address, builtin)?;
                if b == 0.0 {
                    return Err(format!("{}: Division by zero", self.location(address)));
                }
                self.alloc_number(a / b)
            }
            Builtin::Mod => {
                let (a, b) = self.numeric_args(current, address, builtin)?;
                if b == 0.0 {
                    return Err(format!("{}: Division by zero", self.location(address)));
                }
                self.alloc_number(a % b)
            }
            Builtin::Eq => {
                let (a, b) = self.numeric_args(current, address, builtin)?;
                self.bool_ptr(a == b)
            }
            Builtin::Ne => {
                let (a, b) = self.numeric_args(current, address, builtin)?;
                self.bool_ptr(a != b)
            }
            Builtin::Lt => {
                let (a, b) = self.numeric_args(current, address, builtin)?;
                self.bool_ptr(a < b)
            }
            Builtin::Le => {
                let (a, b) = self.numeric_args(current, address, builtin)?;
                self.bool_ptr(a <= b)
            }
            Builtin::Gt => {
                let (a, b) = self.numeric_args(current, address, builtin)?;
                self.bool_ptr(a > b)
            }
            Builtin::Ge => {
                let (a, b) = self.numeric_args(current, address, builtin)?;
                self.bool_ptr(a >= b)
            }
            Builtin::And => {
                let a = self.arg(current, 0);
                let b = self.arg(current, 1);
                self.bool_ptr(self.truthy(a) && self.truthy(b))
            }
            Builtin::Or => {
                let a = self.arg(current, 0);
                let b = self.arg(current, 1);
                self.bool_ptr(self.truthy(a) || self.truthy(b))
            }
            Builtin::Not => {
                let a = self.arg(current, 0);
                self.bool_ptr(!self.truthy(a))
            }
            Builtin::Sqrt => {
                let value = self.numeric_arg(current, address, builtin, 0)?;
                self.alloc_number(value.sqrt())
            }
            Builtin::Floor => {
                let value = self.numeric_arg(current, address, builtin, 0)?;
                self.alloc_number(value.floor())
            }
            Builtin::Ceil => {
                let value = self.numeric_arg(current, address, builtin, 0)?;
                self.alloc_number(value.ceil())
            }
            Builtin::If => {
                let cond = self.arg(current, 0);
                if self.truthy(cond) {
                    self.raw_arg(current, 1)
                } else {
                    self.raw_arg(current, 2)
                }
            }
            Builtin::Cons => {
                let head = self.raw_arg(current, 0);
                let tail = self.raw_arg(current, 1);
                self.heap.alloc(CellValue::Cons { head, tail })
            }
            Builtin::Head => {
                let arg = self.arg(current, 0);
                match self.heap.value(arg).clone() {
                    CellValue::Cons { head, .. } => head,
                    CellValue::Array(array) if !array.is_empty() => array.elements[0],
                    CellValue::ArrayRef { array, index } => {
                        self.array_element(address, array, index)?
                    }
                    other => {
                        return Err(format!(
                            "{}: head: expected cons, got {}",
                            self.location(address),
                            other.type_name()
                        ))
                    }
                }
            }
            Builtin::Tail => {
                let arg = self.arg(current, 0);
                match self.heap.value(arg).clone() {
                    CellValue::Cons { tail, .. } => tail,
                    CellValue::Array(array) if !array.is_empty() => {
                        self.array_suffix(arg, 1)
                    }
                    CellValue::ArrayRef { array, index } => self.array_suffix(array, index + 1),
                    other => {
                        return Err(format!(
                            "{}: tail: expected cons, got {}",
                            self.location(address),
                            other.type_name()
                        ))
                    }
                }
            }
            Builtin::ArraySize => {
                let arg = self.arg(current, 0);
                let size = self.spine_length(address, arg)?;
                self.alloc_number(size as f64)
            }
            Builtin::ArraySkip => {
                let count = self.numeric_arg(current, address, builtin, 0)? as usize;
                let list = self.arg(current, 1);
                self.skip_spine(address, list, count)?
            }
            Builtin::ArrayItem => {
                let index = self.numeric_arg(current, address, builtin, 0)? as usize;
                let list = self.arg(current, 1);
                let suffix = self.skip_spine(address, list, index)?;
                let suffix = self.heap.resolve(suffix);
                match self.heap.value(suffix).clone() {
                    CellValue::Cons { head, .. } => head,
                    CellValue::Array(array) if !array.is_empty() => array.elements[0],
                    CellValue::ArrayRef { array, index } => {
                        self.array_element(address, array, index)?
                    }
                    other => {
                        return Err(format!(
                            "{}: arrayitem: index out of range ({})",
                            self.location(address),
                            other.type_name()
                        ))
                    }
                }
            }
            Builtin::IsNil => {
                let arg = self.arg(current, 0);
                let result = matches!(self.heap.value(arg), CellValue::Nil);
                self.bool_ptr(result)
            }
            Builtin::IsNumber => {
                let arg = self.arg(current, 0);
                let result = matches!(self.heap.value(arg), CellValue::Number(_));
                self.bool_ptr(result)
            }
            Builtin::IsString => {
                let arg = self.arg(current, 0);
                let result = matches!(self.heap.value(arg), CellValue::Str(_));
                self.bool_ptr(result)
            }
            Builtin::IsCons => {
                let arg = self.arg(current, 0);
                let result = matches!(
                    self.heap.value(arg),
                    CellValue::Cons { .. } | CellValue::Array(_) | CellValue::ArrayRef { .. }
                );
                self.bool_ptr(result)
            }
            Builtin::IsFunction => {
                let arg = self.arg(current, 0);
                let result = matches!(
                    self.heap.value(arg),
                    CellValue::Cap(_) | CellValue::ScRef(_) | CellValue::Builtin(_)
                );
                self.bool_ptr(result)
            }
            Builtin::Seq => self.raw_arg(current, 1),
            Builtin::Par => {
                let candidate = self.arg(current, 0);
                if let CellValue::Frame(id) = *self.heap.value(candidate) {
                    self.spark_frame(id);
                }
                self.raw_arg(current, 1)
            }
            Builtin::ParHead => {
                let candidate = self.arg(current, 0);
                if let CellValue::Cons { head, .. } = *self.heap.value(candidate) {
                    let head = self.heap.resolve(head);
                    if let CellValue::Frame(id) = *self.heap.value(head) {
                        self.spark_frame(id);
                    }
                }
                self.raw_arg(current, 1)
            }
            Builtin::Error => {
                let arg = self.arg(current, 0);
                let message = match self.heap.value(arg) {
                    CellValue::Str(value) => value.to_string(),
                    other => format!("<{}>", other.type_name()),
                };
                return Err(format!("{}: {}", self.location(address), message));
            }
        };
        let frame = self.heap.frames.get_mut(current);
        let len = frame.data.len();
        frame.data.truncate(len - info.nargs);
        frame.data.push(result);
        Ok(())
    }

    /// Argument as written, without resolving indirections (lazy
    /// positions must keep sharing the original thunk)
    fn raw_arg(&self, current: FrameId, argno: usize) -> CellPtr {
        self.heap.frames.get(current).at_offset(argno)
    }
    fn arg(&self, current: FrameId, argno: usize) -> CellPtr {
        self.heap.resolve(self.raw_arg(current, argno))
    }
    fn truthy(&self, ptr: CellPtr) -> bool {
        !matches!(self.heap.value(ptr), CellValue::Nil)
    }
    fn numeric_arg(
        &self,
        current: FrameId,
        address: InstructionPointer,
        builtin: Builtin,
        argno: usize,
    ) -> Result<f64, String> {
        let ptr = self.arg(current, argno);
        match self.heap.value(ptr) {
            CellValue::Number(value) => Ok(*value),
            other => Err(format!(
                "{}: {}: argument must be a number, got {}",
                self.location(address),
                builtin.name(),
                other.type_name()
            )),
        }
    }
    fn numeric_args(
        &self,
        current: FrameId,
        address: InstructionPointer,
        builtin: Builtin,
    ) -> Result<(f64, f64), String> {
        Ok((
            self.numeric_arg(current, address, builtin, 0)?,
            self.numeric_arg(current, address, builtin, 1)?,
        ))
    }

    fn array_element(
        &self,
        address: InstructionPointer,
        array: CellPtr,
        index: usize,
    ) -> Result<CellPtr, String> {
        match self.heap.value(array) {
            CellValue::Array(chunk) if index < chunk.len() => Ok(chunk.elements[index]),
            other => Err(format!(
                "{}: Dangling array reference ({})",
                self.location(address),
                other.type_name()
            )),
        }
    }

    /// The list continuing `index` elements into the given array chunk
    pub fn array_suffix_ptr(&mut self, array: CellPtr, index: usize) -> CellPtr {
        self.array_suffix(array, index)
    }

    /// The list starting `index` elements into the given array chunk
    fn array_suffix(&mut self, array: CellPtr, index: usize) -> CellPtr {
        match self.heap.value(array) {
            CellValue::Array(chunk) => {
                if index < chunk.len() {
                    self.heap.alloc(CellValue::ArrayRef { array, index })
                } else {
                    chunk.tail
                }
            }
            _ => array,
        }
    }

    fn spine_length(
        &self,
        address: InstructionPointer,
        list: CellPtr,
    ) -> Result<usize, String> {
        let mut count = 0;
        let mut current = self.heap.resolve(list);
        loop {
            match self.heap.value(current).clone() {
                CellValue::Nil => return Ok(count),
                CellValue::Cons { tail, .. } => {
                    count += 1;
                    current = self.heap.resolve(tail);
                }
                CellValue::Array(array) => {
                    count += array.len();
                    current = self.heap.resolve(array.tail);
                }
                CellValue::ArrayRef { array, index } => match self.heap.value(array) {
                    CellValue::Array(chunk) => {
                        count += chunk.len().saturating_sub(index);
                        current = self.heap.resolve(chunk.tail);
                    }
                    _ => {
                        return Err(format!(
                            "{}: Dangling array reference",
                            self.location(address)
                        ))
                    }
                },
                other => {
                    return Err(format!(
                        "{}: arraysize: spine is not fully evaluated ({})",
                        self.location(address),
                        other.type_name()
                    ))
                }
            }
        }
    }

    fn skip_spine(
        &mut self,
        address: InstructionPointer,
        list: CellPtr,
        count: usize,
    ) -> Result<CellPtr, String> {
        let mut remaining = count;
        let mut current = self.heap.resolve(list);
        while remaining > 0 {
            match self.heap.value(current).clone() {
                CellValue::Nil => return Ok(current),
                CellValue::Cons { tail, .. } => {
                    remaining -= 1;
                    current = self.heap.resolve(tail);
                }
                CellValue::Array(chunk) => {
                    if remaining < chunk.len() {
                        return Ok(self.heap.alloc(CellValue::ArrayRef {
                            array: current,
                            index: remaining,
                        }));
                    }
                    remaining -= chunk.len();
                    current = self.heap.resolve(chunk.tail);
                }
                CellValue::ArrayRef { array, index } => {
                    let (len, tail) = match self.heap.value(array) {
                        CellValue::Array(chunk) => (chunk.len(), chunk.tail),
                        _ => {
                            return Err(format!(
                                "{}: Dangling array reference",
                                self.location(address)
                            ))
                        }
                    };
                    let available = len.saturating_sub(index);
                    if remaining < available {
                        return Ok(self.heap.alloc(CellValue::ArrayRef {
                            array,
                            index: index + remaining,
                        }));
                    }
                    remaining -= available;
                    current = self.heap.resolve(tail);
                }
                other => {
                    return Err(format!(
                        "{}: arrayskip: spine is not fully evaluated ({})",
                        self.location(address),
                        other.type_name()
                    ))
                }
            }
        }
        Ok(current)
    }
}

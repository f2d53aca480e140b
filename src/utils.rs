use std::marker::PhantomData;

use anyhow::Result;

use crate::error::{Error, ErrorKind};

#[derive(Debug, Clone)]
pub struct IdGenerator<T: From<usize>> {
    next_id: usize,
    phantom: PhantomData<T>,
}

impl<T: From<usize>> IdGenerator<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gen(&mut self) -> T {
        let id = self.next_id;
        self.next_id += 1;
        T::from(id)
    }
}

impl<T: From<usize>> Default for IdGenerator<T> {
    fn default() -> IdGenerator<T> {
        IdGenerator {
            next_id: 0,
            phantom: PhantomData,
        }
    }
}

/// Generates `prefix-1`, `prefix-2`, … names for anonymous output columns.
#[derive(Debug, Clone)]
pub struct NameGenerator {
    prefix: &'static str,
    id: IdGenerator<usize>,
}

impl NameGenerator {
    pub fn new(prefix: &'static str) -> Self {
        NameGenerator {
            prefix,
            id: IdGenerator::new(),
        }
    }

    pub fn gen(&mut self) -> String {
        format!("{}-{}", self.prefix, self.id.gen() + 1)
    }
}

pub trait IntoOnly {
    type Item;

    fn into_only(self) -> Result<Self::Item>;
}

impl<T> IntoOnly for Vec<T> {
    type Item = T;

    fn into_only(mut self) -> Result<T> {
        match self.len() {
            1 => Ok(self.swap_remove(0)),
            _ => Err(Error::new(ErrorKind::Translation(
                "expected a single-column expression in {EXPR}".to_string(),
            ))
            .into()),
        }
    }
}

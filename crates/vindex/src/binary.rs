//! Identity (binary) vindex: keyspace id is the raw byte form of the value.

use std::collections::HashMap;
use std::sync::Arc;

use kmx_common::{KmxError, Result};
use kmx_sql::Value;

use crate::destination::{KeyRange, ShardDestination};
use crate::vindex::{
    find_unknown_params, Hashing, Reversible, Sequential, SingleColumn, VCursor, Vindex,
};

/// Vindex that converts binary bits to a keyspace id.
#[derive(Debug)]
pub struct Binary {
    name: String,
    unknown_params: Vec<String>,
}

impl Binary {
    /// Factory registered under `"binary"`.
    pub fn create(name: &str, params: &HashMap<String, String>) -> Result<Arc<dyn Vindex>> {
        Ok(Arc::new(Binary {
            name: name.to_string(),
            unknown_params: find_unknown_params(params, &[]),
        }))
    }
}

impl Vindex for Binary {
    fn name(&self) -> &str {
        &self.name
    }

    fn cost(&self) -> u32 {
        0
    }

    fn is_unique(&self) -> bool {
        true
    }

    fn needs_vcursor(&self) -> bool {
        false
    }

    fn unknown_params(&self) -> &[String] {
        &self.unknown_params
    }

    fn as_single_column(&self) -> Option<&dyn SingleColumn> {
        Some(self)
    }

    fn as_reversible(&self) -> Option<&dyn Reversible> {
        Some(self)
    }

    fn as_hashing(&self) -> Option<&dyn Hashing> {
        Some(self)
    }

    fn as_sequential(&self) -> Option<&dyn Sequential> {
        Some(self)
    }
}

impl SingleColumn for Binary {
    fn map(
        &self,
        _cursor: Option<&mut dyn VCursor>,
        ids: &[Value],
    ) -> Result<Vec<ShardDestination>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(ShardDestination::KeyspaceId(self.hash(id)?));
        }
        Ok(out)
    }

    fn verify(
        &self,
        _cursor: Option<&mut dyn VCursor>,
        ids: &[Value],
        ksids: &[Vec<u8>],
    ) -> Result<Vec<bool>> {
        let mut out = Vec::with_capacity(ids.len());
        for (id, ksid) in ids.iter().zip(ksids.iter()) {
            out.push(self.hash(id)? == *ksid);
        }
        Ok(out)
    }
}

impl Reversible for Binary {
    fn reverse_map(
        &self,
        _cursor: Option<&mut dyn VCursor>,
        ksids: &[Option<Vec<u8>>],
    ) -> Result<Vec<Value>> {
        let mut out = Vec::with_capacity(ksids.len());
        for ksid in ksids {
            match ksid {
                Some(bytes) => out.push(Value::VarBinary(bytes.clone())),
                None => {
                    return Err(KmxError::Execution(
                        "binary reverse_map: keyspace id is absent".to_string(),
                    ));
                }
            }
        }
        Ok(out)
    }
}

impl Hashing for Binary {
    fn hash(&self, id: &Value) -> Result<Vec<u8>> {
        id.to_bytes().ok_or_else(|| {
            KmxError::Execution("binary hash: cannot map a NULL value".to_string())
        })
    }
}

impl Sequential for Binary {
    fn range_map(
        &self,
        _cursor: Option<&mut dyn VCursor>,
        start: &Value,
        end: &Value,
    ) -> Result<Vec<ShardDestination>> {
        let start_ksid = self.hash(start)?;
        let end_ksid = self.hash(end)?;
        Ok(vec![ShardDestination::KeyRange(KeyRange::new(
            start_ksid, end_ksid,
        ))])
    }
}

#[cfg(test)]
mod tests {
    use super::Binary;
    use crate::destination::ShardDestination;
    use crate::vindex::{Hashing, Reversible, Sequential, SingleColumn, Vindex};
    use kmx_sql::Value;
    use std::collections::HashMap;

    fn binary() -> Binary {
        Binary {
            name: "binary".to_string(),
            unknown_params: Vec::new(),
        }
    }

    #[test]
    fn attributes() {
        let v = binary();
        assert_eq!(v.name(), "binary");
        assert_eq!(v.cost(), 0);
        assert!(v.is_unique());
        assert!(!v.needs_vcursor());
        assert!(v.unknown_params().is_empty());
    }

    #[test]
    fn map_wraps_raw_bytes() {
        let v = binary();
        let dests = v
            .map(None, &[Value::VarBinary(vec![1, 2, 3]), Value::Int64(7)])
            .expect("map");
        assert_eq!(
            dests,
            vec![
                ShardDestination::KeyspaceId(vec![1, 2, 3]),
                ShardDestination::KeyspaceId(b"7".to_vec()),
            ]
        );
    }

    #[test]
    fn reverse_map_roundtrips_non_null_values() {
        let v = binary();
        let id = Value::VarBinary(b"\x16k@\xb4J\xbaK\xd6".to_vec());
        let ShardDestination::KeyspaceId(ksid) = v.map(None, &[id.clone()]).expect("map")[0].clone()
        else {
            panic!("expected keyspace id destination");
        };
        let back = v.reverse_map(None, &[Some(ksid)]).expect("reverse");
        assert_eq!(back, vec![id]);
    }

    #[test]
    fn reverse_map_fails_on_absent_ksid() {
        let v = binary();
        let err = v.reverse_map(None, &[None]).expect_err("must fail");
        assert!(err.to_string().contains("keyspace id is absent"), "{err}");
    }

    #[test]
    fn range_map_yields_single_keyrange() {
        let v = binary();
        let dests = v
            .range_map(
                None,
                &Value::VarBinary(vec![0x40]),
                &Value::VarBinary(vec![0x80]),
            )
            .expect("range_map");
        assert_eq!(dests.len(), 1);
        let ShardDestination::KeyRange(kr) = &dests[0] else {
            panic!("expected key range destination");
        };
        assert_eq!(kr.start, vec![0x40]);
        assert_eq!(kr.end, vec![0x80]);
    }

    #[test]
    fn hash_rejects_null() {
        let v = binary();
        assert!(v.hash(&Value::Null).is_err());
    }

    #[test]
    fn verify_compares_hashed_bytes() {
        let v = binary();
        let out = v
            .verify(
                None,
                &[Value::VarBinary(vec![1]), Value::VarBinary(vec![2])],
                &[vec![1], vec![9]],
            )
            .expect("verify");
        assert_eq!(out, vec![true, false]);
    }

    #[test]
    fn unknown_params_are_preserved() {
        let mut params = HashMap::new();
        params.insert("hash_width".to_string(), "8".to_string());
        let v = Binary::create("binary", &params).expect("create");
        assert_eq!(v.unknown_params(), &["hash_width".to_string()]);
    }
}

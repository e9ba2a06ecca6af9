//! Static geometry the component tree is built from.

use serde::{Deserialize, Serialize};

/// Physical basket type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BasketType {
    /// SPINE basket, 10 pins.
    Spine,
    /// Unipuck, 16 pins.
    #[default]
    Unipuck,
    /// Any other holder with a fixed number of pins.
    Custom {
        /// Pins per basket.
        samples: usize,
    },
}

impl BasketType {
    /// Number of pin positions in the basket.
    pub fn samples(&self) -> usize {
        match self {
            BasketType::Spine => 10,
            BasketType::Unipuck => 16,
            BasketType::Custom { samples } => *samples,
        }
    }
}

/// Layout of the storage served by a changer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Geometry {
    /// `baskets` identical baskets in a dewar.
    Pucks {
        /// Dewar positions.
        baskets: usize,
        /// Type of every basket.
        #[serde(default)]
        basket_type: BasketType,
    },
    /// One basket type per dewar position.
    Mixed {
        /// Basket type per position, in dewar order.
        baskets: Vec<BasketType>,
    },
    /// Crystallization plate: `rows x cols` cells with `drops` drops each.
    Plate {
        /// Plate rows, lettered from `A`.
        rows: usize,
        /// Plate columns.
        cols: usize,
        /// Drops per cell.
        drops: usize,
    },
}

impl Geometry {
    /// Uniform dewar of unipucks.
    pub fn unipucks(baskets: usize) -> Self {
        Geometry::Pucks {
            baskets,
            basket_type: BasketType::Unipuck,
        }
    }

    /// Basket types in dewar order. Empty for plates.
    pub fn basket_types(&self) -> Vec<BasketType> {
        match self {
            Geometry::Pucks {
                baskets,
                basket_type,
            } => vec![*basket_type; *baskets],
            Geometry::Mixed { baskets } => baskets.clone(),
            Geometry::Plate { .. } => Vec::new(),
        }
    }

    /// Whether this is a plate layout.
    pub fn is_plate(&self) -> bool {
        matches!(self, Geometry::Plate { .. })
    }

    /// Number of top-level holders (baskets or plate cells).
    pub fn holder_count(&self) -> usize {
        match self {
            Geometry::Pucks { baskets, .. } => *baskets,
            Geometry::Mixed { baskets } => baskets.len(),
            Geometry::Plate { rows, cols, .. } => rows * cols,
        }
    }

    /// Reasons the geometry cannot produce a usable tree.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Geometry::Pucks {
                baskets,
                basket_type,
            } => {
                if *baskets == 0 {
                    return Err("geometry needs at least one basket".into());
                }
                if basket_type.samples() == 0 {
                    return Err("basket type has no sample positions".into());
                }
            }
            Geometry::Mixed { baskets } => {
                if baskets.is_empty() {
                    return Err("geometry needs at least one basket".into());
                }
                if let Some(pos) = baskets.iter().position(|b| b.samples() == 0) {
                    return Err(format!("basket {} has no sample positions", pos + 1));
                }
            }
            Geometry::Plate { rows, cols, drops } => {
                if *rows == 0 || *cols == 0 || *drops == 0 {
                    return Err("plate geometry needs rows, cols and drops > 0".into());
                }
                if *rows > 26 {
                    return Err("plates support at most 26 rows".into());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basket_sizes() {
        assert_eq!(BasketType::Spine.samples(), 10);
        assert_eq!(BasketType::Unipuck.samples(), 16);
        assert_eq!(BasketType::Custom { samples: 12 }.samples(), 12);
    }

    #[test]
    fn test_geometry_from_toml() {
        let g: Geometry = toml::from_str(
            r#"
            type = "mixed"
            baskets = ["spine", "unipuck", { custom = { samples = 4 } }]
            "#,
        )
        .unwrap();
        assert_eq!(g.holder_count(), 3);
        assert_eq!(g.basket_types()[2].samples(), 4);

        let g: Geometry = toml::from_str("type = \"pucks\"\nbaskets = 29").unwrap();
        assert_eq!(g, Geometry::unipucks(29));
    }

    #[test]
    fn test_validate() {
        assert!(Geometry::unipucks(0).validate().is_err());
        assert!(Geometry::Plate {
            rows: 8,
            cols: 12,
            drops: 3
        }
        .validate()
        .is_ok());
        assert!(Geometry::Plate {
            rows: 27,
            cols: 1,
            drops: 1
        }
        .validate()
        .is_err());
    }
}

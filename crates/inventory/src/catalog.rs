use stockroom_core::{
    ChildCollection, DedupRule, DomainResult, EntityDescriptor, EntityKind, ReferenceField,
    Registry,
};

pub const CATEGORIES: EntityKind = EntityKind::new("categories");
pub const PRODUCTS: EntityKind = EntityKind::new("products");
pub const STOCK_INS: EntityKind = EntityKind::new("stock_ins");
pub const BACK_ORDERS: EntityKind = EntityKind::new("back_orders");
pub const STOCK_OUTS: EntityKind = EntityKind::new("stock_outs");
pub const SALES_RETURNS: EntityKind = EntityKind::new("sales_returns");
pub const SALES_RETURN_ITEMS: EntityKind = EntityKind::new("sales_return_items");

const PRODUCT_REFS: &[ReferenceField] = &[ReferenceField {
    field: "categoryId",
    target: CATEGORIES,
}];

const STOCK_IN_REFS: &[ReferenceField] = &[ReferenceField {
    field: "productId",
    target: PRODUCTS,
}];

const BACK_ORDER_REFS: &[ReferenceField] = &[ReferenceField {
    field: "productId",
    target: PRODUCTS,
}];

// A stock-out draws either from a stock-in batch or from a back-order.
const STOCK_OUT_REFS: &[ReferenceField] = &[
    ReferenceField {
        field: "productId",
        target: PRODUCTS,
    },
    ReferenceField {
        field: "stockInId",
        target: STOCK_INS,
    },
    ReferenceField {
        field: "backOrderId",
        target: BACK_ORDERS,
    },
];

const SALES_RETURN_REFS: &[ReferenceField] = &[ReferenceField {
    field: "stockOutId",
    target: STOCK_OUTS,
}];

const SALES_RETURN_CHILDREN: &[ChildCollection] = &[ChildCollection {
    field: "items",
    kind: SALES_RETURN_ITEMS,
}];

const SALES_RETURN_ITEM_REFS: &[ReferenceField] = &[
    ReferenceField {
        field: "salesReturnId",
        target: SALES_RETURNS,
    },
    ReferenceField {
        field: "productId",
        target: PRODUCTS,
    },
];

/// Every entity type of the inventory application.
pub fn descriptors() -> Vec<EntityDescriptor> {
    vec![
        EntityDescriptor::new(CATEGORIES, "/categories"),
        EntityDescriptor::new(PRODUCTS, "/products").with_references(PRODUCT_REFS),
        EntityDescriptor::new(STOCK_INS, "/stock-in")
            .with_references(STOCK_IN_REFS)
            .with_dedup(DedupRule::Content {
                fields: &["productId", "quantity"],
            }),
        EntityDescriptor::new(BACK_ORDERS, "/back-orders")
            .with_references(BACK_ORDER_REFS)
            .with_dedup(DedupRule::Content {
                fields: &["productId", "quantity"],
            }),
        EntityDescriptor::new(STOCK_OUTS, "/stock-out")
            .with_references(STOCK_OUT_REFS)
            .with_dedup(DedupRule::Grouped {
                key_field: "transactionId",
            }),
        EntityDescriptor::new(SALES_RETURNS, "/sales-returns")
            .with_references(SALES_RETURN_REFS)
            .with_dedup(DedupRule::Content {
                fields: &["stockOutId", "reason"],
            })
            .with_children(SALES_RETURN_CHILDREN),
        EntityDescriptor::new(SALES_RETURN_ITEMS, "/sales-return-items")
            .with_references(SALES_RETURN_ITEM_REFS),
    ]
}

/// The validated inventory registry.
pub fn registry() -> DomainResult<Registry> {
    Registry::new(descriptors())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_is_a_valid_registry() {
        let reg = registry().unwrap();
        assert_eq!(reg.len(), 7);
    }

    #[test]
    fn stages_follow_the_stock_flow() {
        let reg = registry().unwrap();
        assert_eq!(
            reg.stages(),
            &[
                vec![CATEGORIES],
                vec![PRODUCTS],
                vec![STOCK_INS, BACK_ORDERS],
                vec![STOCK_OUTS],
                vec![SALES_RETURNS],
                vec![SALES_RETURN_ITEMS],
            ]
        );
    }

    #[test]
    fn sales_return_closure_reaches_products() {
        let reg = registry().unwrap();
        let closure = reg.closure(SALES_RETURNS).unwrap();
        assert_eq!(
            closure,
            vec![
                CATEGORIES,
                PRODUCTS,
                STOCK_INS,
                BACK_ORDERS,
                STOCK_OUTS,
                SALES_RETURNS
            ]
        );
    }

    #[test]
    fn stock_out_groups_by_transaction() {
        let reg = registry().unwrap();
        let d = reg.descriptor(STOCK_OUTS).unwrap();
        assert_eq!(
            d.dedup,
            DedupRule::Grouped {
                key_field: "transactionId"
            }
        );
        assert!(d.is_reference("stockInId"));
        assert!(d.is_reference("backOrderId"));
        assert!(!d.is_reference("transactionId"));
    }

    #[test]
    fn sales_return_declares_item_children() {
        let reg = registry().unwrap();
        let d = reg.descriptor(SALES_RETURNS).unwrap();
        assert_eq!(d.children.len(), 1);
        assert_eq!(d.children[0].kind, SALES_RETURN_ITEMS);
    }
}

//! Order aggregate: an order owning its lines.

use unit_of_work::{Attribute, DomainEntity, Entity, EntityId, EntityType};

use super::{Money, OrderError};

/// One line of an order.
///
/// Lines have no lifecycle outside their order's `lines` collection; they are
/// inserted and deleted through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderLine {
    id: Option<EntityId>,
    order_id: Option<EntityId>,
    pub product: String,
    pub quantity: u32,
    pub price: Money,
}

impl OrderLine {
    /// Creates a validated, not yet persisted line.
    pub fn new(
        product: impl Into<String>,
        quantity: u32,
        price: Money,
    ) -> Result<Self, OrderError> {
        validate_line(quantity, price)?;
        Ok(Self {
            id: None,
            order_id: None,
            product: product.into(),
            quantity,
            price,
        })
    }

    /// Rebuilds a persisted line from storage.
    pub fn restore(
        id: EntityId,
        order_id: EntityId,
        product: impl Into<String>,
        quantity: u32,
        price: Money,
    ) -> Self {
        Self {
            id: Some(id),
            order_id: Some(order_id),
            product: product.into(),
            quantity,
            price,
        }
    }

    /// Id of the owning order, once it has one.
    pub fn order_id(&self) -> Option<EntityId> {
        self.order_id
    }

    /// Links the line to its owning order's storage id.
    pub fn attach_to(&mut self, order_id: EntityId) {
        self.order_id = Some(order_id);
    }

    pub fn change_quantity(&mut self, quantity: u32) -> Result<(), OrderError> {
        if quantity == 0 {
            return Err(OrderError::InvalidQuantity { quantity });
        }
        self.quantity = quantity;
        Ok(())
    }

    /// Returns quantity * price.
    pub fn total_price(&self) -> Money {
        self.price.times(self.quantity)
    }
}

impl DomainEntity for OrderLine {
    const ENTITY_TYPE: EntityType = EntityType::new("OrderLine");

    fn id(&self) -> Option<EntityId> {
        self.id
    }

    fn assign_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn attributes(&self) -> Vec<(&'static str, Attribute)> {
        vec![
            ("order_id", Attribute::value(self.order_id.map(|id| id.as_i64()))),
            ("product", Attribute::value(self.product.as_str())),
            ("quantity", Attribute::value(self.quantity)),
            ("price", Attribute::value(self.price)),
        ]
    }
}

/// Order aggregate root.
#[derive(Debug)]
pub struct Order {
    id: Option<EntityId>,
    pub customer: String,
    lines: Vec<Entity<OrderLine>>,
}

impl Order {
    /// Creates a new, empty order.
    pub fn new(customer: impl Into<String>) -> Result<Self, OrderError> {
        let customer = customer.into();
        if customer.trim().is_empty() {
            return Err(OrderError::EmptyCustomer);
        }
        Ok(Self {
            id: None,
            customer,
            lines: Vec::new(),
        })
    }

    /// Rebuilds a persisted order from storage.
    pub fn restore(id: EntityId, customer: impl Into<String>, lines: Vec<Entity<OrderLine>>) -> Self {
        Self {
            id: Some(id),
            customer: customer.into(),
            lines,
        }
    }

    pub fn lines(&self) -> &[Entity<OrderLine>] {
        &self.lines
    }

    /// Appends a new line and returns its handle.
    ///
    /// The line is linked to this order's id if the order is already persisted.
    pub fn add_line(
        &mut self,
        product: impl Into<String>,
        quantity: u32,
        price: Money,
    ) -> Result<Entity<OrderLine>, OrderError> {
        let mut line = OrderLine::new(product, quantity, price)?;
        if let Some(id) = self.id {
            line.attach_to(id);
        }
        let line = Entity::new(line);
        self.lines.push(line.clone());
        Ok(line)
    }

    /// Removes a line by identity, returning it if it was present.
    pub fn remove_line(&mut self, line: &Entity<OrderLine>) -> Option<Entity<OrderLine>> {
        let position = self.lines.iter().position(|l| l == line)?;
        Some(self.lines.remove(position))
    }

    pub fn rename_customer(&mut self, customer: impl Into<String>) -> Result<(), OrderError> {
        let customer = customer.into();
        if customer.trim().is_empty() {
            return Err(OrderError::EmptyCustomer);
        }
        self.customer = customer;
        Ok(())
    }

    /// Sum of every line's total price.
    pub fn total_amount(&self) -> Money {
        self.lines.iter().map(|line| line.read().total_price()).sum()
    }
}

impl DomainEntity for Order {
    const ENTITY_TYPE: EntityType = EntityType::new("Order");

    fn id(&self) -> Option<EntityId> {
        self.id
    }

    fn assign_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn attributes(&self) -> Vec<(&'static str, Attribute)> {
        vec![
            ("customer", Attribute::value(self.customer.as_str())),
            ("lines", Attribute::entities(&self.lines)),
        ]
    }
}

fn validate_line(quantity: u32, price: Money) -> Result<(), OrderError> {
    if quantity == 0 {
        return Err(OrderError::InvalidQuantity { quantity });
    }
    if price.is_negative() {
        return Err(OrderError::InvalidPrice {
            price: price.cents(),
        });
    }
    Ok(())
}

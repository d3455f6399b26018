use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{MarketError, Result};
use crate::market::basis::MarketBasis;
use crate::market::price::Price;

/// One breakpoint of a piecewise-linear demand curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub price: f64,
    pub demand: f64,
}

impl PricePoint {
    pub fn new(price: f64, demand: f64) -> Self {
        Self { price, demand }
    }
}

/// The two interchangeable representations of a demand curve: a dense sample
/// per price step, or an ordered breakpoint list interpolated linearly and
/// held flat beyond the first/last point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DemandCurve {
    Dense(Vec<f64>),
    Points(Vec<PricePoint>),
}

/// A participant's demand curve over the market basis' price steps.
///
/// Demand is non-increasing in price (law of demand); a curve violating this
/// is rejected at construction and can never reach an aggregate. The bid
/// number correlates a later price response with the bid that produced it and
/// has no effect on aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    market_basis: MarketBasis,
    bid_number: u64,
    curve: DemandCurve,
}

impl Bid {
    /// Creates a bid from a dense demand array, one value per price step.
    pub fn from_demand_array(
        market_basis: MarketBasis,
        bid_number: u64,
        demand: Vec<f64>,
    ) -> Result<Self> {
        if demand.len() != market_basis.price_steps() as usize {
            return Err(MarketError::invalid_bid(format!(
                "demand array has {} values, market basis has {} price steps",
                demand.len(),
                market_basis.price_steps()
            )));
        }
        validate_demand(&demand)?;

        Ok(Self {
            market_basis,
            bid_number,
            curve: DemandCurve::Dense(demand),
        })
    }

    /// Creates a bid from an ordered breakpoint list.
    pub fn from_price_points(
        market_basis: MarketBasis,
        bid_number: u64,
        points: Vec<PricePoint>,
    ) -> Result<Self> {
        if points.is_empty() {
            return Err(MarketError::invalid_bid("bid has no price points"));
        }
        let mut last: Option<&PricePoint> = None;
        for point in &points {
            if !point.price.is_finite() || !point.demand.is_finite() {
                return Err(MarketError::invalid_bid(format!(
                    "price point ({}, {}) is not finite",
                    point.price, point.demand
                )));
            }
            if let Some(prev) = last {
                if point.price <= prev.price {
                    return Err(MarketError::invalid_bid(
                        "price points must be strictly ascending in price",
                    ));
                }
                if point.demand > prev.demand {
                    return Err(MarketError::invalid_bid(
                        "demand must be non-increasing in price",
                    ));
                }
            }
            last = Some(point);
        }

        Ok(Self {
            market_basis,
            bid_number,
            curve: DemandCurve::Points(points),
        })
    }

    /// Creates a flat curve with the same demand at every price step.
    pub fn flat(market_basis: MarketBasis, demand: f64) -> Result<Self> {
        let steps = market_basis.price_steps() as usize;
        Self::from_demand_array(market_basis, 0, vec![demand; steps])
    }

    pub fn market_basis(&self) -> &MarketBasis {
        &self.market_basis
    }

    pub fn bid_number(&self) -> u64 {
        self.bid_number
    }

    pub fn curve(&self) -> &DemandCurve {
        &self.curve
    }

    /// Re-checks the curve invariants. Construction already enforces them,
    /// but values arriving through deserialization bypass the constructors,
    /// so matchers validate again before a bid can reach any aggregate.
    pub fn validate(&self) -> Result<()> {
        match &self.curve {
            DemandCurve::Dense(demand) => {
                if demand.len() != self.market_basis.price_steps() as usize {
                    return Err(MarketError::invalid_bid(format!(
                        "demand array has {} values, market basis has {} price steps",
                        demand.len(),
                        self.market_basis.price_steps()
                    )));
                }
                validate_demand(demand)
            }
            DemandCurve::Points(points) => {
                Bid::from_price_points(self.market_basis.clone(), 0, points.clone()).map(|_| ())
            }
        }
    }

    /// Copy of this bid carrying a different bid number.
    pub fn with_bid_number(&self, bid_number: u64) -> Self {
        Self {
            market_basis: self.market_basis.clone(),
            bid_number,
            curve: self.curve.clone(),
        }
    }

    /// Demand sampled at every price step. Lossless for both representations:
    /// breakpoints are interpolated linearly and extended flat at the ends.
    pub fn demand_array(&self) -> Vec<f64> {
        match &self.curve {
            DemandCurve::Dense(demand) => demand.clone(),
            DemandCurve::Points(points) => sample_points(&self.market_basis, points),
        }
    }

    /// Breakpoint representation of the curve. For a dense curve, a point is
    /// emitted wherever the slope changes, so resampling the result
    /// reproduces every original value.
    pub fn price_points(&self) -> Vec<PricePoint> {
        match &self.curve {
            DemandCurve::Points(points) => points.clone(),
            DemandCurve::Dense(demand) => compact_to_points(&self.market_basis, demand),
        }
    }

    /// Demand at the step nearest to a real price.
    pub fn demand_at(&self, price_step: u32) -> f64 {
        let demand = self.demand_array();
        demand[self.market_basis.bound_price_step(price_step) as usize]
    }

    /// Piecewise-linear demand at an arbitrary price, flat outside the curve.
    pub fn demand_at_price(&self, price: f64) -> f64 {
        let points = self.price_points();
        interpolate_points(&points, price)
    }

    /// Maximum demand, reached at the lowest price.
    pub fn maximum_demand(&self) -> f64 {
        match &self.curve {
            DemandCurve::Dense(demand) => demand[0],
            DemandCurve::Points(points) => points[0].demand,
        }
    }

    /// Minimum demand, reached at the highest price.
    pub fn minimum_demand(&self) -> f64 {
        match &self.curve {
            DemandCurve::Dense(demand) => demand[demand.len() - 1],
            DemandCurve::Points(points) => points[points.len() - 1].demand,
        }
    }

    /// Pointwise sum of two curves on the shared step grid. Both bids are
    /// sampled at every step first, so sparse bids sum exactly everywhere,
    /// not just at their own breakpoints. The result carries bid number 0.
    pub fn aggregate(&self, other: &Bid) -> Result<Bid> {
        self.market_basis.assert_compatible(&other.market_basis)?;

        let mut demand = self.demand_array();
        for (value, other_value) in demand.iter_mut().zip(other.demand_array()) {
            *value += other_value;
        }
        Bid::from_demand_array(self.market_basis.clone(), 0, demand)
    }

    /// Inverse of [`Bid::aggregate`].
    pub fn subtract(&self, other: &Bid) -> Result<Bid> {
        self.market_basis.assert_compatible(&other.market_basis)?;

        let mut demand = self.demand_array();
        for (value, other_value) in demand.iter_mut().zip(other.demand_array()) {
            *value -= other_value;
        }
        Bid::from_demand_array(self.market_basis.clone(), self.bid_number, demand)
    }

    /// Shifts the whole curve by a constant demand offset.
    pub fn transpose(&self, offset: f64) -> Result<Bid> {
        if !offset.is_finite() {
            return Err(MarketError::invalid_bid("transpose offset must be finite"));
        }
        let demand = self.demand_array().iter().map(|d| d + offset).collect();
        Bid::from_demand_array(self.market_basis.clone(), self.bid_number, demand)
    }

    /// Resamples the piecewise-linear curve at another basis' step prices.
    /// The new basis must cover the same commodity and currency; values that
    /// cannot be represented fail instead of being silently clamped.
    pub fn rebase(&self, new_basis: &MarketBasis) -> Result<Bid> {
        if self.market_basis == *new_basis {
            return Ok(Bid {
                market_basis: new_basis.clone(),
                bid_number: self.bid_number,
                curve: self.curve.clone(),
            });
        }
        if !self.market_basis.same_commodity(new_basis) {
            return Err(MarketError::incompatible_basis(
                &self.market_basis,
                new_basis,
            ));
        }

        let points = self.price_points();
        let steps = new_basis.price_steps();
        let increment = new_basis.price_increment();
        let mut demand = Vec::with_capacity(steps as usize);
        for step in 0..steps {
            let price = new_basis.minimum_price() + step as f64 * increment;
            let value = interpolate_points(&points, self.market_basis.bound_price(price));
            if !value.is_finite() {
                return Err(MarketError::invalid_bid(format!(
                    "rebased demand at price {} is not representable",
                    price
                )));
            }
            demand.push(value);
        }
        Bid::from_demand_array(new_basis.clone(), self.bid_number, demand)
    }

    /// Resolves the lowest price at which aggregate supply meets or exceeds
    /// aggregate demand: scan upward for the first step where demand crosses
    /// or reaches zero, interpolating the exact crossing price between the
    /// bracketing steps. A curve that never reaches zero clamps to the
    /// boundary (minimum price for pure supply, maximum for pure demand).
    pub fn equilibrium_price(&self) -> Price {
        let demand = self.demand_array();
        let basis = &self.market_basis;
        let increment = basis.price_increment();

        let crossing = demand.iter().position(|d| *d <= 0.0);
        let raw_price = match crossing {
            None => basis.maximum_price(),
            // Demand is already met at the lowest price.
            Some(0) => basis.minimum_price(),
            Some(step) => {
                let above = demand[step - 1];
                let below = demand[step];
                let left_price = basis.minimum_price() + (step - 1) as f64 * increment;
                if below == 0.0 {
                    left_price + increment
                } else {
                    // Linear interpolation between the bracketing steps.
                    let fraction = above / (above - below);
                    left_price + fraction * increment
                }
            }
        };

        Price::bounded(basis.clone(), raw_price)
    }
}

impl fmt::Display for Bid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bid{{bidNumber={}, demand={:?}, {}}}",
            self.bid_number,
            self.demand_array(),
            self.market_basis
        )
    }
}

/// Pointwise sum of any number of valid bids on the same basis. Commutative
/// and associative; an empty slice yields the flat zero curve.
pub fn aggregate_bids(market_basis: &MarketBasis, bids: &[Bid]) -> Result<Bid> {
    let mut aggregate = Bid::flat(market_basis.clone(), 0.0)?;
    for bid in bids {
        aggregate = aggregate.aggregate(bid)?;
    }
    Ok(aggregate)
}

fn validate_demand(demand: &[f64]) -> Result<()> {
    if demand.is_empty() {
        return Err(MarketError::invalid_bid("demand array is empty"));
    }
    let mut last = f64::INFINITY;
    for value in demand {
        if !value.is_finite() {
            return Err(MarketError::invalid_bid(format!(
                "demand value {} is not finite",
                value
            )));
        }
        if *value > last {
            return Err(MarketError::invalid_bid(
                "demand must be non-increasing in price",
            ));
        }
        last = *value;
    }
    Ok(())
}

/// Samples a breakpoint curve at every step of the basis: flat up to the
/// first point, linear between points, flat after the last point.
fn sample_points(basis: &MarketBasis, points: &[PricePoint]) -> Vec<f64> {
    let steps = basis.price_steps() as usize;
    let mut demand = vec![0.0; steps];
    let mut i = 0usize;
    let mut last_value = points[0].demand;
    for point in points {
        let step = basis.bound_price_step(basis.to_price_step(point.price)) as usize;
        let value = point.demand;
        if step >= i {
            let span = (step - i + 1) as f64;
            let delta = (value - last_value) / span;
            while i <= step {
                demand[i] = value - (step - i) as f64 * delta;
                i += 1;
            }
        } else {
            // Two points collapsing onto one step: the later value wins.
            demand[step] = value;
        }
        last_value = value;
    }
    while i < steps {
        demand[i] = last_value;
        i += 1;
    }
    demand
}

/// Emits a breakpoint at every slope change of the dense curve (always
/// including both ends), so linear resampling reproduces every value.
fn compact_to_points(basis: &MarketBasis, demand: &[f64]) -> Vec<PricePoint> {
    let steps = demand.len();
    let point_at = |i: usize| PricePoint::new(basis.to_price(i as u32), demand[i]);
    if steps == 1 {
        return vec![point_at(0)];
    }

    let mut points = vec![point_at(0)];
    for i in 1..steps - 1 {
        let slope_before = demand[i] - demand[i - 1];
        let slope_after = demand[i + 1] - demand[i];
        if slope_before != slope_after {
            points.push(point_at(i));
        }
    }
    points.push(point_at(steps - 1));
    points
}

/// Piecewise-linear evaluation of a breakpoint curve, flat outside.
fn interpolate_points(points: &[PricePoint], price: f64) -> f64 {
    if price <= points[0].price {
        return points[0].demand;
    }
    let last = &points[points.len() - 1];
    if price >= last.price {
        return last.demand;
    }

    let mut ix = 1;
    while points[ix].price < price {
        ix += 1;
    }
    let lower = &points[ix - 1];
    let upper = &points[ix];
    let factor = (price - lower.price) / (upper.price - lower.price);
    (1.0 - factor) * lower.demand + factor * upper.demand
}
